//! Moving add-on folders aside instead of deleting them.
//!
//! A [`TrashBatch`] moves folders into a fresh directory under the profile's
//! trash dir and remembers where each came from, so a failed mutation can put
//! everything back with [`TrashBatch::restore`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};

use crate::runtime::Runtime;

static BATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct TrashBatch<R: Runtime> {
    runtime: Arc<R>,
    dir: PathBuf,
    moved: Vec<(PathBuf, PathBuf)>,
}

impl<R: Runtime> TrashBatch<R> {
    pub fn new(runtime: Arc<R>, trash_root: &Path) -> Self {
        let name = format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            BATCH_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            runtime,
            dir: trash_root.join(name),
            moved: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }

    /// Moves `path` into the batch. Missing paths are skipped.
    pub fn move_aside(&mut self, path: &Path) -> Result<()> {
        if !self.runtime.exists(path) {
            debug!("Nothing to trash at {:?}", path);
            return Ok(());
        }
        let name = path
            .file_name()
            .with_context(|| format!("Cannot trash {:?}", path))?;

        self.runtime.create_dir_all(&self.dir)?;
        let target = self.dir.join(name);
        debug!("Trashing {:?} -> {:?}", path, target);
        self.runtime.rename(path, &target)?;
        self.moved.push((path.to_path_buf(), target));
        Ok(())
    }

    /// Puts every trashed path back, most recent first.
    ///
    /// Anything occupying an original location is removed first; that is the
    /// partially written replacement.
    pub fn restore(mut self) -> Result<()> {
        let mut first_error = None;
        while let Some((original, trashed)) = self.moved.pop() {
            let result = (|| -> Result<()> {
                if self.runtime.exists(&original) {
                    self.runtime.remove_dir_all(&original)?;
                }
                self.runtime.rename(&trashed, &original)
            })();
            if let Err(e) = result {
                warn!("Failed to restore {:?} from trash: {:#}", original, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e).context("Failed to restore trashed folders"),
            None => Ok(()),
        }
    }

    /// Keeps the trashed folders where they are.
    pub fn commit(self) -> Vec<PathBuf> {
        self.moved.into_iter().map(|(_, trashed)| trashed).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntime, RealRuntime};
    use mockall::predicate::eq;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_move_aside_and_commit() {
        let dir = tempdir().unwrap();
        let addon = dir.path().join("AddOns/Molinari");
        fs::create_dir_all(&addon).unwrap();
        fs::write(addon.join("Molinari.toc"), "## Title: Molinari").unwrap();

        let mut batch = TrashBatch::new(Arc::new(RealRuntime), &dir.path().join("trash"));
        batch.move_aside(&addon).unwrap();
        assert!(!batch.is_empty());

        let trashed = batch.commit();
        assert!(!addon.exists());
        assert_eq!(trashed.len(), 1);
        assert!(trashed[0].join("Molinari.toc").exists());
    }

    #[test]
    fn test_restore_replaces_partial_folder() {
        let dir = tempdir().unwrap();
        let addon = dir.path().join("AddOns/Molinari");
        fs::create_dir_all(&addon).unwrap();
        fs::write(addon.join("old.lua"), "old").unwrap();

        let mut batch = TrashBatch::new(Arc::new(RealRuntime), &dir.path().join("trash"));
        batch.move_aside(&addon).unwrap();

        // A half-written replacement
        fs::create_dir_all(&addon).unwrap();
        fs::write(addon.join("new.lua"), "new").unwrap();

        batch.restore().unwrap();
        assert!(addon.join("old.lua").exists());
        assert!(!addon.join("new.lua").exists());
    }

    #[test]
    fn test_missing_path_is_skipped() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_exists()
            .with(eq(PathBuf::from("/addons/Gone")))
            .returning(|_| false);
        runtime.expect_rename().never();

        let mut batch = TrashBatch::new(Arc::new(runtime), Path::new("/trash"));
        batch.move_aside(Path::new("/addons/Gone")).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_batches_get_distinct_dirs() {
        let runtime = Arc::new(RealRuntime);
        let a = TrashBatch::new(runtime.clone(), Path::new("/trash"));
        let b = TrashBatch::new(runtime, Path::new("/trash"));
        assert_ne!(a.dir(), b.dir());
    }
}
