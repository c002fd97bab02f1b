//! Reconciliation of add-on folders nobody owns yet.
//!
//! Three passes run in decreasing order of precision, each over the folders
//! earlier passes left unmatched:
//!
//! 1. source IDs embedded in the TOC (`X-Curse-Project-ID`, `X-WoWI-ID`)
//! 2. folder-name sets listed in the catalogue for the active flavour
//! 3. the TOC title against catalogue add-on names
//!
//! Within a pass, folders whose candidate definitions intersect are merged
//! into one group. Groups from different passes that share a folder or a
//! definition are merged once more at the end, so each folder belongs to at
//! most one group.

mod merge;
mod toc;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use log::debug;
use thiserror::Error;

use crate::catalogue::Catalogue;
use crate::config::Flavour;
use crate::definition::Definition;
use crate::resolver::slugify;
use crate::runtime::Runtime;

pub use merge::{Group, merge_intersecting_sets, merge_overlapping_groups};
pub use toc::{AddonFolder, Toc};

/// Folder-name prefix of the game's own add-ons.
pub const BUILTIN_PREFIX: &str = "Blizzard_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatcherKind {
    TocSourceIds,
    FolderNames,
    AddonNames,
}

impl MatcherKind {
    /// Every pass, most precise first.
    pub const ALL: [MatcherKind; 3] = [
        MatcherKind::TocSourceIds,
        MatcherKind::FolderNames,
        MatcherKind::AddonNames,
    ];
}

impl fmt::Display for MatcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatcherKind::TocSourceIds => "toc_source_ids",
            MatcherKind::FolderNames => "folder_names",
            MatcherKind::AddonNames => "addon_names",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown matcher '{0}'; expected toc_source_ids, folder_names or addon_names")]
pub struct MatcherParseError(String);

impl FromStr for MatcherKind {
    type Err = MatcherParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "toc_source_ids" | "toc" => Ok(MatcherKind::TocSourceIds),
            "folder_names" | "folders" => Ok(MatcherKind::FolderNames),
            "addon_names" | "names" => Ok(MatcherKind::AddonNames),
            _ => Err(MatcherParseError(s.to_string())),
        }
    }
}

/// Runs matcher passes over leftover folders. Produces unresolved groups;
/// resolving their definitions is up to the caller.
pub struct Matcher<'a, R: Runtime> {
    runtime: &'a R,
    catalogue: &'a Catalogue,
    flavour: Flavour,
}

impl<'a, R: Runtime> Matcher<'a, R> {
    pub fn new(runtime: &'a R, catalogue: &'a Catalogue, flavour: Flavour) -> Self {
        Self {
            runtime,
            catalogue,
            flavour,
        }
    }

    /// Runs the requested passes in precision order.
    pub fn run(&self, kinds: &[MatcherKind], leftovers: &[AddonFolder]) -> Vec<Group<String, Definition>> {
        let mut matched: BTreeSet<String> = BTreeSet::new();
        let mut groups = Vec::new();

        for kind in MatcherKind::ALL.into_iter().filter(|k| kinds.contains(k)) {
            let unmatched: Vec<&AddonFolder> = leftovers
                .iter()
                .filter(|f| !matched.contains(&f.name))
                .collect();
            if unmatched.is_empty() {
                break;
            }

            let items = match kind {
                MatcherKind::TocSourceIds => self.match_toc_source_ids(&unmatched),
                MatcherKind::FolderNames => self.match_folder_names(leftovers, &unmatched),
                MatcherKind::AddonNames => self.match_addon_names(&unmatched),
            };
            let merged = merge_intersecting_sets(items);
            debug!("Matcher pass {} produced {} groups", kind, merged.len());

            for (folders, _) in &merged {
                matched.extend(folders.iter().cloned());
            }
            groups.extend(merged);
        }

        merge_overlapping_groups(groups)
    }

    fn match_toc_source_ids(&self, unmatched: &[&AddonFolder]) -> Vec<Group<String, Definition>> {
        unmatched
            .iter()
            .filter_map(|folder| {
                let toc = folder.toc(self.runtime)?;
                let ids: BTreeSet<Definition> = [("curse", toc.curse_id()), ("wowi", toc.wowi_id())]
                    .into_iter()
                    .filter_map(|(source, id)| Some(Definition::new(source, id?)))
                    .collect();
                (!ids.is_empty()).then(|| (BTreeSet::from([folder.name.clone()]), ids))
            })
            .collect()
    }

    /// A catalogue folder set matches when every folder in it is a leftover
    /// and at least one of them is still unmatched.
    fn match_folder_names(
        &self,
        leftovers: &[AddonFolder],
        unmatched: &[&AddonFolder],
    ) -> Vec<Group<String, Definition>> {
        let present: BTreeSet<&str> = leftovers.iter().map(|f| f.name.as_str()).collect();
        let open: BTreeSet<&str> = unmatched.iter().map(|f| f.name.as_str()).collect();

        let mut items = Vec::new();
        for entry in self.catalogue.for_flavour(self.flavour) {
            for folders in &entry.folders {
                if !folders.is_empty()
                    && folders.iter().all(|f| present.contains(f.as_str()))
                    && folders.iter().any(|f| open.contains(f.as_str()))
                {
                    items.push((folders.clone(), BTreeSet::from([entry.to_definition()])));
                }
            }
        }
        items
    }

    fn match_addon_names(&self, unmatched: &[&AddonFolder]) -> Vec<Group<String, Definition>> {
        let mut by_name: HashMap<String, BTreeSet<Definition>> = HashMap::new();
        for entry in self.catalogue.for_flavour(self.flavour) {
            by_name
                .entry(slugify(&entry.name))
                .or_default()
                .insert(entry.to_definition());
        }

        unmatched
            .iter()
            .filter_map(|folder| {
                let title = folder.toc(self.runtime)?.title()?;
                let defs = by_name.get(&slugify(&title))?;
                Some((BTreeSet::from([folder.name.clone()]), defs.clone()))
            })
            .collect()
    }
}
