//! Update and rollback of installed packages.
//!
//! An update re-resolves with the strategy recorded at install time, so a
//! pinned version keeps resolving to itself and reports up to date.

use futures_util::future::join_all;
use log::info;

use crate::archive::ArchiveExtractor;
use crate::definition::{Definition, Strategy};
use crate::error::PkgError;
use crate::package::Package;
use crate::runtime::Runtime;

use super::{BatchResult, Manager, log_internal};

impl<R: Runtime + 'static, E: ArchiveExtractor + 'static> Manager<R, E> {
    #[tracing::instrument(skip(self, defs), fields(count = defs.len()))]
    pub async fn update(&self, defs: &[Definition]) -> anyhow::Result<BatchResult<Package>> {
        let lookup = defs.to_vec();
        let installed: Vec<Option<Package>> = self
            .store_op(move |store| lookup.iter().map(|def| store.find_by_definition(def)).collect())
            .await?;

        // Re-resolve with what was recorded, not with what was asked for
        let queries: Vec<Definition> = installed.iter().flatten().map(Definition::from_pkg).collect();
        let mut resolved = self.resolve(&queries, false).await.into_iter();

        let mut updates = Vec::with_capacity(defs.len());
        for old in installed {
            let resolution = old.as_ref().and_then(|_| resolved.next()).map(|(_, r)| r);
            updates.push(async move {
                let Some(old) = old else {
                    return Err(PkgError::NotInstalled);
                };
                let new = resolution.unwrap_or(Err(PkgError::Nonexistent))?;
                self.update_one(old, new).await
            });
        }

        Ok(defs
            .iter()
            .cloned()
            .zip(join_all(updates).await)
            .map(|(def, outcome)| {
                log_internal(&def, &outcome);
                (def, outcome)
            })
            .collect())
    }

    /// Installs `version` of an installed package in place of the current one.
    #[tracing::instrument(skip(self), fields(def = %def))]
    pub async fn rollback(&self, def: &Definition, version: &str) -> Result<Package, PkgError> {
        let outcome = self.rollback_inner(def, version).await;
        log_internal(def, &outcome);
        outcome
    }

    async fn rollback_inner(&self, def: &Definition, version: &str) -> Result<Package, PkgError> {
        let lookup = def.clone();
        let old = self
            .store_op(move |store| store.find_by_definition(&lookup))
            .await
            .map_err(PkgError::internal)?
            .ok_or(PkgError::NotInstalled)?;

        let resolver = self.registry.get(&old.source).ok_or(PkgError::SourceInvalid)?;
        let strategy = Strategy::Version(version.to_string());
        if !resolver.supports_rollback() {
            return Err(PkgError::StrategyUnsupported(strategy));
        }

        let query = Definition::from_pkg(&old).with_strategy(strategy);
        let new = resolver.resolve_one(&self.ctx, &query, None).await?;
        self.update_one(old, new).await
    }

    async fn update_one(&self, old: Package, new: Package) -> Result<Package, PkgError> {
        if old.same_file_as(&new) {
            return Err(PkgError::UpToDate);
        }
        let prepared = self.prepare(new).await?;

        let _guard = self.lock_profile().await.map_err(PkgError::internal)?;
        let (source, id) = (old.source.clone(), old.id.clone());
        let current = self
            .store_op(move |store| store.get(&source, &id))
            .await
            .map_err(PkgError::internal)?
            .ok_or(PkgError::NotInstalled)?;

        let displaced = self.check_conflicts(&prepared.pkg, Some(&current), false).await?;
        self.apply(&prepared, Some(&current), &displaced).await?;
        info!(
            "Updated {} {} -> {}",
            current.to_ref(),
            current.version,
            prepared.pkg.version
        );
        Ok(prepared.pkg)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::manager;
    use super::*;
    use crate::archive::test_support::zip_bytes;
    use crate::definition::StrategyTag;
    use crate::package::test_support::package;
    use crate::resolver::{Resolver, ResolverContext, ResolverRegistry, SourceMetadata};
    use async_trait::async_trait;
    use reqwest::Url;
    use crate::archive::MockArchiveExtractor;
    use crate::runtime::RealRuntime;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    static VERSIONED: SourceMetadata = SourceMetadata {
        id: "versioned",
        name: "Versioned",
        strategies: &[StrategyTag::Default, StrategyTag::Version],
    };

    /// Resolves "foo" to whatever version `current` holds; the version
    /// strategy picks that exact version.
    struct VersionedResolver {
        base_url: String,
        current: Arc<Mutex<String>>,
    }

    #[async_trait]
    impl Resolver for VersionedResolver {
        fn metadata(&self) -> &SourceMetadata {
            &VERSIONED
        }

        fn get_alias_from_url(&self, _url: &Url) -> Option<String> {
            None
        }

        async fn resolve_one(
            &self,
            _ctx: &ResolverContext,
            def: &Definition,
            _metadata: Option<serde_json::Value>,
        ) -> Result<Package, PkgError> {
            if def.key() != "foo" {
                return Err(PkgError::Nonexistent);
            }
            let version = match &def.strategy {
                Strategy::Version(v) => v.clone(),
                _ => self.current.lock().unwrap().clone(),
            };
            let mut pkg = package("versioned", "foo", "foo", &["Foo"]);
            pkg.version = version.clone();
            pkg.download_url = format!("{}/foo-{}.zip", self.base_url, version);
            Ok(pkg.with_strategy(def.strategy.clone()))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        server: mockito::ServerGuard,
        _mocks: Vec<mockito::Mock>,
        current: Arc<Mutex<String>>,
        manager: crate::application::Manager<crate::runtime::RealRuntime>,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let mut mocks = vec![];
        for version in ["1.0", "2.0"] {
            mocks.push(
                server
                    .mock("GET", format!("/foo-{}.zip", version).as_str())
                    .with_body(zip_bytes(&[("Foo/Foo.toc", version)]))
                    .create_async()
                    .await,
            );
        }
        let current = Arc::new(Mutex::new("1.0".to_string()));
        let mut registry = ResolverRegistry::new();
        registry.register(VersionedResolver {
            base_url: server.url(),
            current: current.clone(),
        });
        let manager = manager(dir.path(), registry);
        Fixture {
            dir,
            server,
            _mocks: mocks,
            current,
            manager,
        }
    }

    fn toc(fixture: &Fixture) -> String {
        fs::read_to_string(fixture.manager.profile().addon_path("Foo").join("Foo.toc")).unwrap()
    }

    #[tokio::test]
    async fn test_update_not_installed() {
        let f = fixture().await;
        let results = f.manager.update(&[Definition::new("versioned", "foo")]).await.unwrap();
        assert!(matches!(results[0].1, Err(PkgError::NotInstalled)));
    }

    #[test_log::test(tokio::test)]
    async fn test_update_replaces_record_and_files() {
        let f = fixture().await;
        let def = Definition::new("versioned", "foo");
        f.manager.install(std::slice::from_ref(&def), false).await.unwrap();

        let results = f.manager.update(std::slice::from_ref(&def)).await.unwrap();
        assert!(matches!(results[0].1, Err(PkgError::UpToDate)));

        *f.current.lock().unwrap() = "2.0".into();
        let results = f.manager.update(&[def]).await.unwrap();
        assert_eq!(results[0].1.as_ref().unwrap().version, "2.0");
        assert_eq!(toc(&f), "2.0");

        let installed = f.manager.installed().unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].version, "2.0");
    }

    #[tokio::test]
    async fn test_failed_update_keeps_old_record_and_files() {
        let mut f = fixture().await;
        let def = Definition::new("versioned", "foo");
        f.manager.install(std::slice::from_ref(&def), false).await.unwrap();

        // 3.0 downloads fine but is not a valid archive
        let _broken = f.server
            .mock("GET", "/foo-3.0.zip")
            .with_body("not a zip")
            .create_async()
            .await;
        *f.current.lock().unwrap() = "3.0".into();

        let results = f.manager.update(&[def]).await.unwrap();
        assert!(results[0].1.is_err());

        let installed = f.manager.installed().unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].version, "1.0");
        assert_eq!(toc(&f), "1.0");
    }

    #[tokio::test]
    async fn test_extraction_failure_restores_old_folders_and_record() {
        let f = fixture().await;
        let def = Definition::new("versioned", "foo");
        f.manager.install(std::slice::from_ref(&def), false).await.unwrap();
        *f.current.lock().unwrap() = "2.0".into();

        let old_folder_present = Arc::new(AtomicBool::new(true));
        let seen = old_folder_present.clone();
        let mut extractor = MockArchiveExtractor::new();
        extractor
            .expect_members::<RealRuntime>()
            .returning(|_, _| Ok(vec!["Foo/Foo.toc".to_string()]));
        extractor
            .expect_extract::<RealRuntime>()
            .times(1)
            .returning(move |_, _, addon_dir, _| {
                seen.store(addon_dir.join("Foo").exists(), Ordering::SeqCst);
                // Half of the new version is written when extraction fails
                fs::create_dir_all(addon_dir.join("Foo"))?;
                fs::write(addon_dir.join("Foo/Foo.toc"), "2.0 partial")?;
                Err(anyhow::anyhow!("disk full"))
            });

        let mut registry = ResolverRegistry::new();
        registry.register(VersionedResolver {
            base_url: f.server.url(),
            current: f.current.clone(),
        });
        let failing = manager(f.dir.path(), registry).with_extractor(extractor);

        let results = failing.update(&[def]).await.unwrap();
        assert!(matches!(results[0].1, Err(PkgError::Internal(_))));
        assert!(!old_folder_present.load(Ordering::SeqCst));

        assert_eq!(toc(&f), "1.0");
        let installed = failing.installed().unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].version, "1.0");
    }

    #[tokio::test]
    async fn test_update_with_unusable_trash_leaves_old_version() {
        let f = fixture().await;
        let def = Definition::new("versioned", "foo");
        f.manager.install(std::slice::from_ref(&def), false).await.unwrap();
        *f.current.lock().unwrap() = "2.0".into();

        // The old folders cannot be moved aside
        let trash = f.manager.profile().trash_dir(f.manager.global());
        fs::create_dir_all(trash.parent().unwrap()).unwrap();
        fs::write(&trash, "not a directory").unwrap();

        let results = f.manager.update(&[def]).await.unwrap();
        assert!(matches!(results[0].1, Err(PkgError::Internal(_))));
        assert_eq!(toc(&f), "1.0");
        assert_eq!(f.manager.installed().unwrap()[0].version, "1.0");
    }

    #[tokio::test]
    async fn test_rollback_and_pinned_update() {
        let f = fixture().await;
        *f.current.lock().unwrap() = "2.0".into();
        let def = Definition::new("versioned", "foo");
        f.manager.install(std::slice::from_ref(&def), false).await.unwrap();

        let pkg = f.manager.rollback(&def, "1.0").await.unwrap();
        assert_eq!(pkg.version, "1.0");
        assert_eq!(pkg.options.strategy, Strategy::Version("1.0".into()));
        assert_eq!(toc(&f), "1.0");

        // The recorded pin survives updates
        let results = f.manager.update(&[def]).await.unwrap();
        assert!(matches!(results[0].1, Err(PkgError::UpToDate)));
    }
}
