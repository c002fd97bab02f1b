//! Reconciliation of add-on folders that no installed package owns.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::archive::ArchiveExtractor;
use crate::definition::Definition;
use crate::matcher::{AddonFolder, BUILTIN_PREFIX, Matcher, MatcherKind};
use crate::package::Package;
use crate::runtime::Runtime;

use super::{BatchResult, Manager, blocking};

/// A definition that resolved, together with what it resolved to.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub definition: Definition,
    pub package: Package,
}

/// Folders that belong together and the packages that could own them.
#[derive(Debug, Clone)]
pub struct MatchGroup {
    pub folders: BTreeSet<String>,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Default)]
pub struct MatchReport {
    pub groups: Vec<MatchGroup>,
    /// Folders that ended up in no group with a candidate.
    pub unreconciled: Vec<AddonFolder>,
}

impl<R: Runtime + 'static, E: ArchiveExtractor + 'static> Manager<R, E> {
    /// Top-level folders in the add-on directory that no package owns,
    /// ignoring the game's own add-ons. Ownership is case-insensitive.
    pub async fn get_unreconciled_folders(&self) -> Result<Vec<AddonFolder>> {
        let owned: HashSet<String> = self
            .store_op(|store| {
                Ok(store
                    .all()?
                    .into_iter()
                    .flat_map(|pkg| pkg.folders)
                    .map(|folder| folder.to_lowercase())
                    .collect())
            })
            .await?;

        let runtime = self.runtime.clone();
        let addon_dir = self.ctx.profile.addon_dir.clone();
        let flavour = self.ctx.flavour();
        blocking(move || {
            let entries = runtime
                .read_dir(&addon_dir)
                .with_context(|| format!("Failed to list add-on directory {:?}", addon_dir))?;

            let mut folders: Vec<AddonFolder> = entries
                .into_iter()
                .filter(|path| runtime.is_dir(path))
                .filter_map(|path| {
                    let name = path.file_name()?.to_str()?.to_string();
                    let skip = name.starts_with('.')
                        || name.starts_with(BUILTIN_PREFIX)
                        || owned.contains(&name.to_lowercase());
                    (!skip).then(|| AddonFolder::new(name, path, flavour))
                })
                .collect();
            folders.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(folders)
        })
        .await
    }

    /// Runs the matcher passes and resolves every definition they found in
    /// one batch. Only groups with at least one resolved candidate are kept.
    #[tracing::instrument(skip(self, leftovers), fields(leftovers = leftovers.len()))]
    pub async fn run_matcher(
        &self,
        kinds: &[MatcherKind],
        leftovers: Vec<AddonFolder>,
    ) -> Result<MatchReport> {
        let runtime = self.runtime.clone();
        let catalogue = self.catalogue.clone();
        let flavour = self.ctx.flavour();
        let kinds = kinds.to_vec();
        let (groups, leftovers) = blocking(move || {
            let groups = Matcher::new(&*runtime, &catalogue, flavour).run(&kinds, &leftovers);
            Ok((groups, leftovers))
        })
        .await?;

        let mut seen = BTreeSet::new();
        let defs: Vec<Definition> = groups
            .iter()
            .flat_map(|(_, defs)| defs.iter())
            .filter(|def| seen.insert((*def).clone()))
            .cloned()
            .collect();
        debug!("Resolving {} matched definitions", defs.len());

        let resolved: BTreeMap<Definition, Package> = self
            .resolve(&defs, false)
            .await
            .into_iter()
            .filter_map(|(def, result)| Some((def, result.ok()?)))
            .collect();

        let groups: Vec<MatchGroup> = groups
            .into_iter()
            .filter_map(|(folders, defs)| {
                let candidates: Vec<Candidate> = defs
                    .into_iter()
                    .filter_map(|definition| {
                        let package = resolved.get(&definition)?.clone();
                        Some(Candidate { definition, package })
                    })
                    .collect();
                (!candidates.is_empty()).then_some(MatchGroup { folders, candidates })
            })
            .collect();

        let grouped: HashSet<&String> = groups.iter().flat_map(|g| &g.folders).collect();
        let unreconciled = leftovers
            .into_iter()
            .filter(|f| !grouped.contains(&f.name))
            .collect();

        info!("Matched {} groups", groups.len());
        Ok(MatchReport { groups, unreconciled })
    }

    /// Installs the first candidate of each group over the folders it
    /// matched.
    pub async fn reconcile(&self, groups: &[MatchGroup]) -> Result<BatchResult<Package>> {
        let defs: Vec<Definition> = groups
            .iter()
            .filter_map(|group| group.candidates.first())
            .map(|candidate| Definition::from_pkg(&candidate.package))
            .collect();
        self.install(&defs, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::manager;
    use super::*;
    use crate::archive::test_support::zip_bytes;
    use crate::catalogue::Catalogue;
    use crate::catalogue::test_support::entry;
    use crate::definition::StrategyTag;
    use crate::error::PkgError;
    use crate::package::test_support::package;
    use crate::resolver::{Resolver, ResolverContext, ResolverRegistry, SourceMetadata};
    use async_trait::async_trait;
    use reqwest::Url;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    static CURSE: SourceMetadata = SourceMetadata {
        id: "curse",
        name: "Fake Curse",
        strategies: &[StrategyTag::Default],
    };

    /// Knows a single project, 42, shipping folders A, B and C.
    struct ProjectResolver {
        base_url: String,
    }

    #[async_trait]
    impl Resolver for ProjectResolver {
        fn metadata(&self) -> &SourceMetadata {
            &CURSE
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
            if def.key() != "42" && def.key() != "abc" {
                return Err(PkgError::Nonexistent);
            }
            let mut pkg = package("curse", "42", "abc", &[]);
            pkg.download_url = format!("{}/abc.zip", self.base_url);
            Ok(pkg)
        }
    }

    fn addon(root: &Path, name: &str, toc: &str) {
        let path = root.join(name);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(format!("{}.toc", name)), toc).unwrap();
    }

    fn names(folders: &[AddonFolder]) -> Vec<&str> {
        folders.iter().map(|f| f.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_unreconciled_folders_skip_owned_and_builtin() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), ResolverRegistry::new());
        let addons = manager.profile().addon_dir.clone();
        for name in ["Zeta", "Alpha", "Owned", "Blizzard_AuctionUI"] {
            addon(&addons, name, "");
        }
        fs::write(addons.join("stray.txt"), "").unwrap();
        manager
            .store
            .insert(&package("wowi", "1", "owned", &["owned"]))
            .unwrap();

        let folders = manager.get_unreconciled_folders().await.unwrap();
        assert_eq!(names(&folders), vec!["Alpha", "Zeta"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_match_and_reconcile() {
        let dir = tempdir().unwrap();
        let mut server = mockito::Server::new_async().await;
        let _zip = server
            .mock("GET", "/abc.zip")
            .with_body(zip_bytes(&[
                ("A/A.toc", "## X-Curse-Project-ID: 42\n"),
                ("B/B.toc", "## X-Curse-Project-ID: 42\n"),
                ("C/C.toc", ""),
            ]))
            .create_async()
            .await;

        let mut registry = ResolverRegistry::new();
        registry.register(ProjectResolver { base_url: server.url() });
        let catalogue = Catalogue::new(vec![entry("curse", "42", "abc", &[&["B", "C"]])]);
        let manager = manager(dir.path(), registry).with_catalogue(catalogue);

        let addons = manager.profile().addon_dir.clone();
        addon(&addons, "A", "## X-Curse-Project-ID: 42\n");
        addon(&addons, "B", "## X-Curse-Project-ID: 42\n");
        addon(&addons, "C", "");
        addon(&addons, "Unknown", "## X-WoWI-ID: 7\n");

        let leftovers = manager.get_unreconciled_folders().await.unwrap();
        let report = manager.run_matcher(&MatcherKind::ALL, leftovers).await.unwrap();

        assert_eq!(report.groups.len(), 1);
        let group = &report.groups[0];
        assert_eq!(
            group.folders,
            BTreeSet::from(["A".to_string(), "B".to_string(), "C".to_string()])
        );
        assert_eq!(group.candidates.len(), 1);
        assert_eq!(group.candidates[0].package.id, "42");
        assert_eq!(names(&report.unreconciled), vec!["Unknown"]);

        let results = manager.reconcile(&report.groups).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.as_ref().unwrap().folders, vec!["A", "B", "C"]);

        let leftovers = manager.get_unreconciled_folders().await.unwrap();
        assert_eq!(names(&leftovers), vec!["Unknown"]);
    }

    #[tokio::test]
    async fn test_removed_folders_kept_on_disk_are_unreconciled() {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path(), ResolverRegistry::new());
        addon(&manager.profile().addon_dir, "Foo", "");
        manager
            .store
            .insert(&package("curse", "1", "foo", &["Foo"]))
            .unwrap();
        assert!(manager.get_unreconciled_folders().await.unwrap().is_empty());

        manager
            .remove(&[Definition::new("curse", "foo")], true)
            .await
            .unwrap();
        let leftovers = manager.get_unreconciled_folders().await.unwrap();
        assert_eq!(names(&leftovers), vec!["Foo"]);
    }
}
