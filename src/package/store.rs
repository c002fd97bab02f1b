//! Record store for installed packages.
//!
//! The store holds one record per installed `(source, id)` together with the
//! folders it owns. Every mutation replaces the whole backing file through a
//! write-to-temp-then-rename, so `insert`, `delete` and `replace` are atomic:
//! a reader either sees the state before a mutation or the state after it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::definition::Definition;
use crate::runtime::Runtime;

use super::Package;

/// Storage for installed package records.
pub trait PackageStore: Send + Sync {
    /// All installed packages.
    fn all(&self) -> Result<Vec<Package>>;

    /// Record a newly installed package.
    fn insert(&self, pkg: &Package) -> Result<()>;

    /// Delete the record for `(source, id)`.
    fn delete(&self, source: &str, id: &str) -> Result<()>;

    /// Delete `old` and insert `new` in one transaction.
    fn replace(&self, old: &Package, new: &Package) -> Result<()>;

    fn get(&self, source: &str, id: &str) -> Result<Option<Package>> {
        Ok(self
            .all()?
            .into_iter()
            .find(|p| p.source == source && p.id == id))
    }

    /// Find the package a definition refers to, by ID or by alias.
    fn find_by_definition(&self, def: &Definition) -> Result<Option<Package>> {
        Ok(self.all()?.into_iter().find(|p| {
            p.source == def.source
                && (def.id.as_deref() == Some(p.id.as_str())
                    || def.alias == p.id
                    || def.alias.eq_ignore_ascii_case(&p.slug))
        }))
    }

    /// The installed package owning a folder, if any.
    fn owner_of(&self, folder: &str) -> Result<Option<Package>> {
        Ok(self
            .all()?
            .into_iter()
            .find(|p| p.folders.iter().any(|f| f.eq_ignore_ascii_case(folder))))
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct StoreFile {
    #[serde(default)]
    packages: Vec<Package>,
}

/// [`PackageStore`] persisted as a single JSON document.
pub struct JsonPackageStore<R: Runtime> {
    runtime: Arc<R>,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl<R: Runtime> JsonPackageStore<R> {
    pub fn new(runtime: Arc<R>, path: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreFile> {
        if !self.runtime.exists(&self.path) {
            return Ok(StoreFile::default());
        }
        let content = self
            .runtime
            .read_to_string(&self.path)
            .with_context(|| format!("Failed to read package records from {:?}", self.path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse package records in {:?}", self.path))
    }

    fn save(&self, file: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !self.runtime.exists(parent)
        {
            self.runtime.create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(file)?;
        let temp_path = self.path.with_extension("json.tmp");
        self.runtime
            .write(&temp_path, content.as_bytes())
            .with_context(|| format!("Failed to write package records to {:?}", temp_path))?;
        self.runtime
            .rename(&temp_path, &self.path)
            .with_context(|| format!("Failed to commit package records to {:?}", self.path))
    }

    /// Runs a read-modify-write cycle under the store's write lock.
    fn transact<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<Package>) -> Result<()>,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("package store lock poisoned"))?;
        let mut file = self.load()?;
        f(&mut file.packages)?;
        self.save(&file)
    }
}

fn check_insertable(packages: &[Package], pkg: &Package) -> Result<()> {
    if packages
        .iter()
        .any(|p| p.source == pkg.source && p.id == pkg.id)
    {
        bail!("{}:{} is already recorded", pkg.source, pkg.id);
    }
    for folder in &pkg.folders {
        if let Some(owner) = packages
            .iter()
            .find(|p| p.folders.iter().any(|f| f.eq_ignore_ascii_case(folder)))
        {
            bail!(
                "folder {} is already owned by {}",
                folder,
                owner.to_ref()
            );
        }
    }
    Ok(())
}

impl<R: Runtime> PackageStore for JsonPackageStore<R> {
    fn all(&self) -> Result<Vec<Package>> {
        Ok(self.load()?.packages)
    }

    fn insert(&self, pkg: &Package) -> Result<()> {
        debug!("Recording {}:{}", pkg.source, pkg.id);
        self.transact(|packages| {
            check_insertable(packages, pkg)?;
            packages.push(pkg.clone());
            Ok(())
        })
    }

    fn delete(&self, source: &str, id: &str) -> Result<()> {
        debug!("Deleting record {}:{}", source, id);
        self.transact(|packages| {
            let before = packages.len();
            packages.retain(|p| !(p.source == source && p.id == id));
            if packages.len() == before {
                bail!("{}:{} is not recorded", source, id);
            }
            Ok(())
        })
    }

    fn replace(&self, old: &Package, new: &Package) -> Result<()> {
        debug!(
            "Replacing record {}:{} ({} -> {})",
            old.source, old.id, old.version, new.version
        );
        self.transact(|packages| {
            let position = packages
                .iter()
                .position(|p| p.source == old.source && p.id == old.id)
                .with_context(|| format!("{}:{} is not recorded", old.source, old.id))?;
            let removed = packages.remove(position);
            if let Err(e) = check_insertable(packages, new) {
                packages.insert(position, removed);
                return Err(e);
            }
            packages.insert(position, new.clone());
            Ok(())
        })
    }
}
