use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use addonpm::application::Manager;
use addonpm::config::{AccessTokens, Flavour, GlobalConfig, ProfileConfig};
use addonpm::definition::Definition;
use addonpm::error::PkgError;
use addonpm::http::HttpClient;
use addonpm::lock::LockRegistry;
use addonpm::resolver::{CurseResolver, ResolverContext, ResolverRegistry, WowiResolver};
use addonpm::runtime::RealRuntime;
use mockito::{Matcher, Mock, Server, ServerGuard};
use tempfile::{TempDir, tempdir};
use zip::ZipWriter;
use zip::write::FileOptions;

fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options: FileOptions<()> = FileOptions::default();
    for (name, content) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn context(root: &Path) -> ResolverContext {
    let addon_dir = root.join("AddOns");
    std::fs::create_dir_all(&addon_dir).unwrap();
    ResolverContext {
        http: HttpClient::new(reqwest::Client::new()),
        global: Arc::new(GlobalConfig {
            config_dir: root.join("config"),
            cache_dir: root.join("cache"),
            state_dir: root.join("state"),
            access_tokens: AccessTokens {
                github: None,
                cfcore: Some("test-key".into()),
            },
        }),
        profile: Arc::new(ProfileConfig::new("test", addon_dir, Flavour::Retail)),
    }
}

/// Molinari on both CurseForge (as `curse:molinari`) and WoWInterface (as
/// `wowi:13188-molinari`), each shipping a `Molinari` folder.
async fn molinari_sources(server: &mut ServerGuard) -> Vec<Mock> {
    let url = server.url();
    vec![
        server
            .mock("GET", "/v1/mods/search")
            .match_query(Matcher::UrlEncoded("slug".into(), "molinari".into()))
            .with_body(
                r#"{"data": [{"id": 20338, "name": "Molinari", "slug": "molinari",
                    "summary": "One-click milling", "links": {}}]}"#,
            )
            .create_async()
            .await,
        server
            .mock("GET", "/v1/mods/20338/files")
            .match_query(Matcher::Any)
            .with_body(format!(
                r#"{{"data": [{{"displayName": "110000.1", "fileDate": "2024-08-01T00:00:00Z",
                    "releaseType": 1, "downloadUrl": "{}/curse/molinari.zip",
                    "sortableGameVersions": [{{"gameVersionTypeId": 517}}],
                    "modules": [{{"name": "Molinari"}}], "dependencies": []}}]}}"#,
                url
            ))
            .create_async()
            .await,
        server
            .mock("GET", "/curse/molinari.zip")
            .with_body(zip_bytes(&[("Molinari/Molinari.toc", "## Title: Molinari\n")]))
            .create_async()
            .await,
        server
            .mock("GET", "/filedetails/13188.json")
            .with_body(format!(
                r#"[{{"UID": "13188", "UIName": "Molinari", "UIVersion": "110000.1",
                    "UIDate": 1722470400000, "UIDownload": "{}/wowi/molinari.zip"}}]"#,
                url
            ))
            .create_async()
            .await,
        server
            .mock("GET", "/wowi/molinari.zip")
            .with_body(zip_bytes(&[("Molinari/Molinari.toc", "## Title: Molinari\n")]))
            .create_async()
            .await,
    ]
}

struct Fixture {
    _dir: TempDir,
    _server: ServerGuard,
    _mocks: Vec<Mock>,
    manager: Manager<RealRuntime>,
}

async fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let mut server = Server::new_async().await;
    let mocks = molinari_sources(&mut server).await;

    let mut registry = ResolverRegistry::new();
    registry.register(CurseResolver::with_api_url(&server.url()));
    registry.register(WowiResolver::with_api_url(&server.url()));
    let manager = Manager::new(
        Arc::new(RealRuntime),
        registry,
        context(dir.path()),
        Arc::new(LockRegistry::new()),
    );

    Fixture {
        _dir: dir,
        _server: server,
        _mocks: mocks,
        manager,
    }
}

#[tokio::test]
async fn test_same_folder_from_another_source_conflicts() {
    let f = fixture().await;

    let results = f
        .manager
        .install(&[Definition::new("curse", "molinari")], false)
        .await
        .unwrap();
    let installed = results[0].1.as_ref().unwrap();
    assert_eq!(installed.id, "20338");
    assert_eq!(installed.folders, vec!["Molinari"]);

    let results = f
        .manager
        .install(&[Definition::new("wowi", "13188-molinari")], false)
        .await
        .unwrap();
    match &results[0].1 {
        Err(PkgError::ConflictsWithInstalled(owner)) => {
            assert_eq!(owner.source, "curse");
            assert_eq!(owner.id, "20338");
        }
        other => panic!("expected a conflict, got {:?}", other),
    }

    // Replacing does not override another package's ownership
    let results = f
        .manager
        .install(&[Definition::new("wowi", "13188-molinari")], true)
        .await
        .unwrap();
    assert!(matches!(results[0].1, Err(PkgError::ConflictsWithInstalled(_))));

    let packages = f.manager.installed().unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].source, "curse");
}

#[tokio::test]
async fn test_removed_package_kept_on_disk_can_be_adopted_by_another_source() {
    let f = fixture().await;
    f.manager
        .install(&[Definition::new("curse", "molinari")], false)
        .await
        .unwrap();

    let results = f
        .manager
        .remove(&[Definition::new("curse", "molinari")], true)
        .await
        .unwrap();
    assert!(results[0].1.is_ok());
    assert!(f.manager.profile().addon_path("Molinari").is_dir());

    let leftovers = f.manager.get_unreconciled_folders().await.unwrap();
    let names: Vec<&str> = leftovers.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["Molinari"]);

    // The folder is now uncontrolled: only a replacing install may take it
    let results = f
        .manager
        .install(&[Definition::new("wowi", "13188-molinari")], false)
        .await
        .unwrap();
    assert!(matches!(results[0].1, Err(PkgError::ConflictsWithUncontrolled(_))));

    let results = f
        .manager
        .install(&[Definition::new("wowi", "13188-molinari")], true)
        .await
        .unwrap();
    assert_eq!(results[0].1.as_ref().unwrap().slug, "molinari");
    assert!(f.manager.get_unreconciled_folders().await.unwrap().is_empty());
}
