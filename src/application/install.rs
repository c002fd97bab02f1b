//! Install, and the archive transaction shared with update.
//!
//! Resolution and download happen before the profile lock is taken. Under
//! the lock, conflicts are checked against the archive's computed folder
//! set before anything on disk changes, so a rejected install leaves the
//! add-on directory untouched.

use std::collections::BTreeSet;
use std::path::PathBuf;

use futures_util::future::join_all;
use log::{debug, info, warn};

use crate::archive::{ArchiveExtractor, base_dirs};
use crate::definition::Definition;
use crate::download::download_archive;
use crate::error::PkgError;
use crate::package::Package;
use crate::runtime::Runtime;
use crate::trash::TrashBatch;

use super::{BatchResult, Manager, blocking, log_internal};

/// A resolved package whose archive is downloaded and scanned.
pub(super) struct Prepared {
    pub pkg: Package,
    pub archive: PathBuf,
    pub base_dirs: BTreeSet<String>,
}

impl<R: Runtime + 'static, E: ArchiveExtractor + 'static> Manager<R, E> {
    /// Installs each definition independently.
    ///
    /// With `replace`, folders on disk that no package owns are moved to the
    /// trash instead of failing with [`PkgError::ConflictsWithUncontrolled`].
    pub async fn install(&self, defs: &[Definition], replace: bool) -> anyhow::Result<BatchResult<Package>> {
        self.install_batch(defs, replace, false).await
    }

    /// Like [`Manager::install`], and also installs the dependencies the
    /// resolved packages declare, one level deep. Dependencies that are
    /// already installed are skipped; the outcomes of the others follow the
    /// input definitions.
    pub async fn install_with_deps(
        &self,
        defs: &[Definition],
        replace: bool,
    ) -> anyhow::Result<BatchResult<Package>> {
        self.install_batch(defs, replace, true).await
    }

    #[tracing::instrument(skip(self, defs), fields(count = defs.len()))]
    async fn install_batch(
        &self,
        defs: &[Definition],
        replace: bool,
        with_deps: bool,
    ) -> anyhow::Result<BatchResult<Package>> {
        let lookup = defs.to_vec();
        let installed: Vec<bool> = self
            .store_op(move |store| {
                lookup
                    .iter()
                    .map(|def| Ok(store.find_by_definition(def)?.is_some()))
                    .collect()
            })
            .await?;

        let mut outcomes: Vec<Option<Result<Package, PkgError>>> = vec![None; defs.len()];
        let mut pending = Vec::new();
        for (i, already) in installed.into_iter().enumerate() {
            if already {
                outcomes[i] = Some(Err(PkgError::AlreadyInstalled));
            } else {
                pending.push(i);
            }
        }

        let to_resolve: Vec<Definition> = pending.iter().map(|&i| defs[i].clone()).collect();
        let mut resolved = self.resolve(&to_resolve, with_deps).await;
        let deps = self.missing_deps(resolved.split_off(to_resolve.len())).await?;

        let installs = pending
            .iter()
            .zip(resolved)
            .map(move |(&i, (_, result))| async move {
                let outcome = match result {
                    Ok(pkg) => self.install_one(pkg, replace).await,
                    Err(e) => Err(e),
                };
                (i, outcome)
            });
        let dep_installs = deps.into_iter().map(move |(def, result)| async move {
            let outcome = match result {
                Ok(pkg) => self.install_one(pkg, replace).await,
                Err(e) => Err(e),
            };
            (def, outcome)
        });
        let (direct, deps) = tokio::join!(join_all(installs), join_all(dep_installs));
        for (i, outcome) in direct {
            outcomes[i] = Some(outcome);
        }

        let mut results: BatchResult<Package> = defs
            .iter()
            .cloned()
            .zip(outcomes)
            .map(|(def, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    Err(PkgError::internal(anyhow::anyhow!("no outcome recorded")))
                });
                (def, outcome)
            })
            .collect();
        results.extend(deps);
        for (def, outcome) in &results {
            log_internal(def, outcome);
        }
        Ok(results)
    }

    /// Drops the dependencies that are already installed.
    async fn missing_deps(&self, deps: BatchResult<Package>) -> anyhow::Result<BatchResult<Package>> {
        if deps.is_empty() {
            return Ok(deps);
        }
        let lookup: Vec<Definition> = deps.iter().map(|(def, _)| def.clone()).collect();
        let installed: Vec<bool> = self
            .store_op(move |store| {
                lookup
                    .iter()
                    .map(|def| Ok(store.find_by_definition(def)?.is_some()))
                    .collect()
            })
            .await?;
        Ok(deps
            .into_iter()
            .zip(installed)
            .filter(|(_, already)| !already)
            .map(|(dep, _)| dep)
            .collect())
    }

    async fn install_one(&self, pkg: Package, replace: bool) -> Result<Package, PkgError> {
        let prepared = self.prepare(pkg).await?;

        let _guard = self.lock_profile().await.map_err(PkgError::internal)?;
        let (source, id) = (prepared.pkg.source.clone(), prepared.pkg.id.clone());
        if self
            .store_op(move |store| store.get(&source, &id))
            .await
            .map_err(PkgError::internal)?
            .is_some()
        {
            return Err(PkgError::AlreadyInstalled);
        }

        let displaced = self.check_conflicts(&prepared.pkg, None, replace).await?;
        self.apply(&prepared, None, &displaced).await?;
        info!("Installed {} {}", prepared.pkg.to_ref(), prepared.pkg.version);
        Ok(prepared.pkg)
    }

    /// Downloads the package's archive and computes the folders it creates.
    /// The package's folder list is replaced by that set.
    pub(super) async fn prepare(&self, mut pkg: Package) -> Result<Prepared, PkgError> {
        let archive = download_archive(
            self.runtime.as_ref(),
            &pkg.download_url,
            &self.ctx.global.downloads_dir(),
            &self.ctx.http,
        )
        .await
        .map_err(PkgError::internal)?;

        let runtime = self.runtime.clone();
        let extractor = self.extractor.clone();
        let path = archive.clone();
        let members = blocking(move || extractor.members(runtime.as_ref(), &path))
            .await
            .map_err(PkgError::internal)?;

        let base_dirs = base_dirs(&members);
        if base_dirs.is_empty() {
            return Err(PkgError::FileUnavailable(
                "archive contains no add-on folders".into(),
            ));
        }
        pkg.folders = base_dirs.iter().cloned().collect();
        Ok(Prepared {
            pkg,
            archive,
            base_dirs,
        })
    }

    /// Checks `new`'s folders against installed packages (other than `old`)
    /// and against unowned folders on disk. Returns the unowned folders to
    /// move aside, which is only allowed with `replace`.
    pub(super) async fn check_conflicts(
        &self,
        new: &Package,
        old: Option<&Package>,
        replace: bool,
    ) -> Result<Vec<String>, PkgError> {
        let installed = self
            .store_op(|store| store.all())
            .await
            .map_err(PkgError::internal)?;
        let is_old = |p: &Package| old.is_some_and(|o| o.source == p.source && o.id == p.id);

        for folder in &new.folders {
            let owner = installed.iter().find(|p| {
                !is_old(p) && p.folders.iter().any(|f| f.eq_ignore_ascii_case(folder))
            });
            if let Some(owner) = owner {
                return Err(PkgError::ConflictsWithInstalled(owner.to_ref()));
            }
        }

        let uncontrolled: BTreeSet<String> = new
            .folders
            .iter()
            .filter(|folder| {
                !old.is_some_and(|o| o.folders.iter().any(|f| f.eq_ignore_ascii_case(folder)))
            })
            .filter(|folder| self.runtime.exists(&self.ctx.profile.addon_path(folder)))
            .cloned()
            .collect();

        if uncontrolled.is_empty() {
            Ok(vec![])
        } else if replace {
            debug!("Replacing unowned folders {:?}", uncontrolled);
            Ok(uncontrolled.into_iter().collect())
        } else {
            Err(PkgError::ConflictsWithUncontrolled(uncontrolled))
        }
    }

    /// Moves `old`'s folders and `displaced` to the trash, extracts the
    /// archive and records the package.
    ///
    /// Nothing is deleted unless every folder the archive creates was cleared
    /// first; after that, a failure deletes what extraction wrote and puts the
    /// trashed folders back. The record store is unchanged either way.
    pub(super) async fn apply(
        &self,
        prepared: &Prepared,
        old: Option<&Package>,
        displaced: &[String],
    ) -> Result<(), PkgError> {
        let profile = &self.ctx.profile;
        let mut trash = TrashBatch::new(self.runtime.clone(), &profile.trash_dir(&self.ctx.global));

        if let Err(e) = self.clear_folders(prepared, old, displaced, &mut trash) {
            warn!("Could not make room for {}: {:#}", prepared.pkg.to_ref(), e);
            if let Err(restore_error) = trash.restore() {
                warn!("{:#}", restore_error);
            }
            return Err(PkgError::internal(e));
        }

        match self.extract_and_record(prepared, old).await {
            Ok(()) => {
                if !trash.is_empty() {
                    debug!("Moving replaced folders to {:?}", trash.dir());
                }
                trash.commit();
                Ok(())
            }
            Err(e) => {
                warn!("Rolling back {}: {:#}", prepared.pkg.to_ref(), e);
                for folder in &prepared.pkg.folders {
                    let path = profile.addon_path(folder);
                    if self.runtime.exists(&path)
                        && let Err(remove_error) = self.runtime.remove_dir_all(&path)
                    {
                        warn!("Failed to remove {:?}: {:#}", path, remove_error);
                    }
                }
                if let Err(restore_error) = trash.restore() {
                    warn!("{:#}", restore_error);
                }
                Err(PkgError::internal(e))
            }
        }
    }

    /// Trashes the folders the new package replaces. Succeeds only when none
    /// of the archive's folders is left on disk.
    fn clear_folders(
        &self,
        prepared: &Prepared,
        old: Option<&Package>,
        displaced: &[String],
        trash: &mut TrashBatch<R>,
    ) -> anyhow::Result<()> {
        let profile = &self.ctx.profile;
        let old_folders = old.map(|o| o.folders.as_slice()).unwrap_or_default();
        for folder in old_folders.iter().chain(displaced) {
            trash.move_aside(&profile.addon_path(folder))?;
        }

        let occupied: Vec<&String> = prepared
            .pkg
            .folders
            .iter()
            .filter(|folder| self.runtime.exists(&profile.addon_path(folder)))
            .collect();
        if !occupied.is_empty() {
            anyhow::bail!("folders still in the way: {:?}", occupied);
        }
        Ok(())
    }

    async fn extract_and_record(&self, prepared: &Prepared, old: Option<&Package>) -> anyhow::Result<()> {
        let runtime = self.runtime.clone();
        let extractor = self.extractor.clone();
        let archive = prepared.archive.clone();
        let addon_dir = self.ctx.profile.addon_dir.clone();
        let base_dirs = prepared.base_dirs.clone();
        blocking(move || extractor.extract(runtime.as_ref(), &archive, &addon_dir, &base_dirs)).await?;

        let new = prepared.pkg.clone();
        match old.cloned() {
            Some(old) => self.store_op(move |store| store.replace(&old, &new)).await,
            None => self.store_op(move |store| store.insert(&new)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, manager};
    use super::*;
    use crate::archive::test_support::zip_bytes;
    use crate::package::test_support::package;
    use crate::package::{JsonPackageStore, PackageStore};
    use crate::resolver::{ResolverContext, ResolverRegistry, SourceMetadata};
    use crate::resolver::Resolver;
    use crate::definition::StrategyTag;
    use crate::runtime::RealRuntime;
    use async_trait::async_trait;
    use reqwest::Url;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    static LOCAL: SourceMetadata = SourceMetadata {
        id: "local",
        name: "Local",
        strategies: &[StrategyTag::Default],
    };

    /// Serves packages whose archives live on a mockito server.
    struct LocalResolver {
        base_url: String,
        folders: Vec<(&'static str, Vec<&'static str>)>,
    }

    #[async_trait]
    impl Resolver for LocalResolver {
        fn metadata(&self) -> &SourceMetadata {
            &LOCAL
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
            let (_, folders) = self
                .folders
                .iter()
                .find(|(alias, _)| *alias == def.alias)
                .ok_or(PkgError::Nonexistent)?;
            let mut pkg = package("local", &def.alias, &def.alias, folders);
            pkg.download_url = format!("{}/{}.zip", self.base_url, def.alias);
            if def.alias == "parent" {
                pkg.deps = vec!["child".into()];
            }
            Ok(pkg)
        }
    }

    async fn serve(
        server: &mut mockito::ServerGuard,
        alias: &str,
        files: &[(&str, &str)],
    ) -> mockito::Mock {
        server
            .mock("GET", format!("/{}.zip", alias).as_str())
            .with_body(zip_bytes(files))
            .create_async()
            .await
    }

    fn registry(server: &mockito::ServerGuard) -> ResolverRegistry {
        let mut registry = ResolverRegistry::new();
        registry.register(LocalResolver {
            base_url: server.url(),
            folders: vec![
                ("foo", vec!["Foo"]),
                ("bar", vec!["Bar"]),
                ("foo-fork", vec!["Foo"]),
                ("empty", vec![]),
                ("parent", vec!["Parent"]),
                ("child", vec!["Child"]),
            ],
        });
        registry
    }

    fn tree(dir: &Path) -> Vec<String> {
        let mut entries: Vec<String> = walk(dir)
            .into_iter()
            .map(|p| p.strip_prefix(dir).unwrap().to_string_lossy().into_owned())
            .collect();
        entries.sort();
        entries
    }

    fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut out = vec![];
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                out.extend(walk(&path));
            }
            out.push(path);
        }
        out
    }

    #[test_log::test(tokio::test)]
    async fn test_install_extracts_and_records() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _foo = serve(&mut server, "foo", &[("Foo/Foo.toc", "## Title: Foo"), ("README.md", "x")]).await;
        let manager = manager(dir.path(), registry(&server));

        let results = manager
            .install(&[Definition::new("local", "foo")], false)
            .await
            .unwrap();

        let pkg = results[0].1.as_ref().unwrap();
        assert_eq!(pkg.folders, vec!["Foo"]);
        let addons = manager.profile().addon_dir.clone();
        assert!(addons.join("Foo/Foo.toc").exists());
        assert!(!addons.join("README.md").exists());
        assert_eq!(manager.installed().unwrap(), vec![pkg.clone()]);
    }

    #[tokio::test]
    async fn test_install_twice_is_already_installed() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _foo = serve(&mut server, "foo", &[("Foo/Foo.toc", "v1")]).await;
        let manager = manager(dir.path(), registry(&server));
        let def = Definition::new("local", "foo");

        manager.install(std::slice::from_ref(&def), false).await.unwrap();
        let addons = manager.profile().addon_dir.clone();
        fs::write(addons.join("Foo/Foo.toc"), "edited").unwrap();
        let records = fs::read_to_string(manager.profile().packages_path(manager.global())).unwrap();

        let results = manager.install(&[def], false).await.unwrap();
        assert!(matches!(results[0].1, Err(PkgError::AlreadyInstalled)));
        assert_eq!(fs::read_to_string(addons.join("Foo/Foo.toc")).unwrap(), "edited");
        assert_eq!(
            fs::read_to_string(manager.profile().packages_path(manager.global())).unwrap(),
            records
        );
    }

    #[tokio::test]
    async fn test_conflict_with_installed_names_owner_and_touches_nothing() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _foo = serve(&mut server, "foo", &[("Foo/Foo.toc", "original")]).await;
        let _foo_fork = serve(&mut server, "foo-fork", &[("Foo/Foo.toc", "fork"), ("Extra/x.lua", "")]).await;
        let manager = manager(dir.path(), registry(&server));

        manager
            .install(&[Definition::new("local", "foo")], false)
            .await
            .unwrap();
        let addons = manager.profile().addon_dir.clone();
        let before = tree(&addons);

        let results = manager
            .install(&[Definition::new("local", "foo-fork")], true)
            .await
            .unwrap();
        match &results[0].1 {
            Err(PkgError::ConflictsWithInstalled(owner)) => assert_eq!(owner.to_string(), "local:foo"),
            other => panic!("unexpected {:?}", other.as_ref().map(|p| &p.id)),
        }
        assert_eq!(tree(&addons), before);
        assert_eq!(fs::read_to_string(addons.join("Foo/Foo.toc")).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_uncontrolled_folder_needs_replace() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _bar = serve(&mut server, "bar", &[("Bar/Bar.toc", "managed")]).await;
        let manager = manager(dir.path(), registry(&server));
        let addons = manager.profile().addon_dir.clone();
        fs::create_dir(addons.join("Bar")).unwrap();
        fs::write(addons.join("Bar/Bar.toc"), "manual").unwrap();

        let results = manager
            .install(&[Definition::new("local", "bar")], false)
            .await
            .unwrap();
        assert!(matches!(
            &results[0].1,
            Err(PkgError::ConflictsWithUncontrolled(folders)) if folders.contains("Bar")
        ));
        assert_eq!(fs::read_to_string(addons.join("Bar/Bar.toc")).unwrap(), "manual");

        let results = manager
            .install(&[Definition::new("local", "bar")], true)
            .await
            .unwrap();
        assert!(results[0].1.is_ok());
        assert_eq!(fs::read_to_string(addons.join("Bar/Bar.toc")).unwrap(), "managed");

        // The manual copy went to the trash rather than being deleted
        let trash = manager.profile().trash_dir(manager.global());
        assert!(tree(&trash).iter().any(|p| p.ends_with("Bar.toc")));
    }

    #[tokio::test]
    async fn test_archive_without_folders_is_file_unavailable() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _empty = serve(&mut server, "empty", &[("loose.lua", "")]).await;
        let manager = manager(dir.path(), registry(&server));

        let results = manager
            .install(&[Definition::new("local", "empty")], false)
            .await
            .unwrap();
        assert!(matches!(results[0].1, Err(PkgError::FileUnavailable(_))));
        assert!(manager.installed().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_record_restores_disk() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _bar = serve(&mut server, "bar", &[("Bar/Bar.toc", "managed")]).await;

        // A store whose file is a directory fails every write
        let ctx = context(dir.path());
        let store_path = dir.path().join("broken-store");
        fs::create_dir_all(store_path.with_extension("json.tmp")).unwrap();
        let store = JsonPackageStore::new(Arc::new(RealRuntime), &store_path);
        assert!(store.all().unwrap().is_empty());

        let manager = manager(dir.path(), registry(&server)).with_store(Arc::new(store));
        let addons = ctx.profile.addon_dir.clone();
        fs::create_dir(addons.join("Bar")).unwrap();
        fs::write(addons.join("Bar/Bar.toc"), "manual").unwrap();

        let results = manager
            .install(&[Definition::new("local", "bar")], true)
            .await
            .unwrap();
        assert!(matches!(results[0].1, Err(PkgError::Internal(_))));
        assert_eq!(fs::read_to_string(addons.join("Bar/Bar.toc")).unwrap(), "manual");
    }

    #[tokio::test]
    async fn test_replace_with_unusable_trash_keeps_unowned_folder() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _bar = serve(&mut server, "bar", &[("Bar/Bar.toc", "managed")]).await;
        let manager = manager(dir.path(), registry(&server));
        let addons = manager.profile().addon_dir.clone();
        fs::create_dir(addons.join("Bar")).unwrap();
        fs::write(addons.join("Bar/Bar.toc"), "manual").unwrap();

        let trash = manager.profile().trash_dir(manager.global());
        fs::create_dir_all(trash.parent().unwrap()).unwrap();
        fs::write(&trash, "not a directory").unwrap();

        let results = manager
            .install(&[Definition::new("local", "bar")], true)
            .await
            .unwrap();
        assert!(matches!(results[0].1, Err(PkgError::Internal(_))));
        assert_eq!(fs::read_to_string(addons.join("Bar/Bar.toc")).unwrap(), "manual");
        assert!(manager.installed().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_install_with_deps_installs_missing_dependencies() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _parent = serve(&mut server, "parent", &[("Parent/Parent.toc", "")]).await;
        let _child = serve(&mut server, "child", &[("Child/Child.toc", "")]).await;
        let manager = manager(dir.path(), registry(&server));

        let results = manager
            .install_with_deps(&[Definition::new("local", "parent")], false)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1.as_ref().unwrap().id, "parent");
        assert_eq!(results[1].0.alias, "child");
        assert_eq!(results[1].1.as_ref().unwrap().id, "child");
        let addons = manager.profile().addon_dir.clone();
        assert!(addons.join("Child/Child.toc").exists());
        assert_eq!(manager.installed().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_installed_dependencies_are_skipped() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _parent = serve(&mut server, "parent", &[("Parent/Parent.toc", "")]).await;
        let _child = serve(&mut server, "child", &[("Child/Child.toc", "")]).await;
        let manager = manager(dir.path(), registry(&server));

        // Without the flag, dependencies are left alone
        let results = manager
            .install(&[Definition::new("local", "parent")], false)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(manager.installed().unwrap().len(), 1);

        manager
            .install(&[Definition::new("local", "child")], false)
            .await
            .unwrap();
        manager
            .remove(&[Definition::new("local", "parent")], false)
            .await
            .unwrap();

        let results = manager
            .install_with_deps(&[Definition::new("local", "parent")], false)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert_eq!(manager.installed().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_definition_is_reported_per_item() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _foo = serve(&mut server, "foo", &[("Foo/Foo.toc", "")]).await;
        let manager = manager(dir.path(), registry(&server));

        let results = manager
            .install(
                &[Definition::new("local", "nope"), Definition::new("local", "foo")],
                false,
            )
            .await
            .unwrap();
        assert!(matches!(results[0].1, Err(PkgError::Nonexistent)));
        assert!(results[1].1.is_ok());
    }
}
