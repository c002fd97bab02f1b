//! Archive inspection and extraction.
//!
//! Add-on archives are expected to hold one or more top-level folders, each
//! of which becomes a folder in the add-on directory. [`base_dirs`] computes
//! that set from the member list before anything is written, and extractors
//! only ever write members that live under one of those folders.

mod tar_gz;
mod zip;

use std::collections::BTreeSet;
use std::path::{Component, Path};

use anyhow::{Result, anyhow};

use crate::runtime::Runtime;

pub use tar_gz::TarGzExtractor;
pub use zip::ZipExtractor;

/// Top-level names that are never add-on folders.
pub const JUNK_TOP_LEVEL_NAMES: &[&str] = &["__MACOSX", ".DS_Store", "Thumbs.db"];

/// Trait for format-specific archive extractors
#[cfg_attr(test, mockall::automock)]
pub trait ArchiveExtractor: Send + Sync {
    /// Check if this extractor can handle the given archive format
    fn can_handle(&self, archive_path: &Path) -> bool;

    /// List member paths, `/`-separated, directories with a trailing `/`.
    fn members<R: Runtime + 'static>(&self, runtime: &R, archive_path: &Path)
    -> Result<Vec<String>>;

    /// Extract the members that live under one of `base_dirs` into `extract_to`.
    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
        base_dirs: &BTreeSet<String>,
    ) -> Result<()>;
}

/// Computes the top-level folders an archive would create.
///
/// A name qualifies when it is a single segment followed by a separator,
/// either as a directory entry of its own or as the prefix of a nested
/// member. Loose top-level files, junk names and path tricks are ignored.
pub fn base_dirs<S: AsRef<str>>(members: &[S]) -> BTreeSet<String> {
    members
        .iter()
        .filter_map(|name| {
            let name = name.as_ref().trim_start_matches("./");
            let (head, _) = name.split_once('/')?;
            Some(head)
        })
        .filter(|head| is_valid_base_dir(head))
        .map(str::to_string)
        .collect()
}

fn is_valid_base_dir(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('\\')
        && !name.starts_with("._")
        && !JUNK_TOP_LEVEL_NAMES.contains(&name)
}

/// Whether a member path lives under one of `base_dirs`. Every component
/// must be a plain name, so `..`, roots and prefixes never qualify.
pub(crate) fn is_member_of(path: &Path, base_dirs: &BTreeSet<String>) -> bool {
    let mut components = path.components();
    let in_base_dir = match components.next() {
        Some(Component::Normal(head)) => head
            .to_str()
            .is_some_and(|head| base_dirs.contains(head)),
        _ => false,
    };
    in_base_dir && components.all(|c| matches!(c, Component::Normal(_)))
}

/// Dispatcher that selects the appropriate extractor based on archive format.
/// Holds all available extractors and dispatches to the correct one.
pub struct ArchiveExtractorImpl {
    tar_gz: TarGzExtractor,
    zip: ZipExtractor,
}

impl Default for ArchiveExtractorImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveExtractorImpl {
    pub fn new() -> Self {
        Self {
            tar_gz: TarGzExtractor,
            zip: ZipExtractor,
        }
    }
}

impl ArchiveExtractor for ArchiveExtractorImpl {
    fn can_handle(&self, archive_path: &Path) -> bool {
        self.tar_gz.can_handle(archive_path) || self.zip.can_handle(archive_path)
    }

    #[tracing::instrument(skip(self, runtime))]
    fn members<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
    ) -> Result<Vec<String>> {
        if self.tar_gz.can_handle(archive_path) {
            return self.tar_gz.members(runtime, archive_path);
        }
        // Downloads from hosts that don't name their files are zips in practice
        self.zip.members(runtime, archive_path)
    }

    #[tracing::instrument(skip(self, runtime, base_dirs))]
    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
        base_dirs: &BTreeSet<String>,
    ) -> Result<()> {
        if base_dirs.is_empty() {
            return Err(anyhow!(
                "Archive {} has no add-on folders",
                archive_path.display()
            ));
        }
        if self.tar_gz.can_handle(archive_path) {
            return self
                .tar_gz
                .extract(runtime, archive_path, extract_to, base_dirs);
        }
        self.zip.extract(runtime, archive_path, extract_to, base_dirs)
    }
}
