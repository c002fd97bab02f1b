//! Remove installed packages.

use log::info;

use crate::definition::Definition;
use crate::error::PkgError;
use crate::package::Package;
use crate::archive::ArchiveExtractor;
use crate::runtime::Runtime;
use crate::trash::TrashBatch;

use super::{BatchResult, Manager, log_internal};

impl<R: Runtime + 'static, E: ArchiveExtractor + 'static> Manager<R, E> {
    /// Removes each definition's package. With `keep_folders` only the
    /// record is deleted; the folders stay on disk, unowned.
    #[tracing::instrument(skip(self, defs), fields(count = defs.len()))]
    pub async fn remove(&self, defs: &[Definition], keep_folders: bool) -> anyhow::Result<BatchResult<Package>> {
        let _guard = self.lock_profile().await?;

        let mut results = Vec::with_capacity(defs.len());
        for def in defs {
            let outcome = self.remove_one(def, keep_folders).await;
            log_internal(def, &outcome);
            results.push((def.clone(), outcome));
        }
        Ok(results)
    }

    async fn remove_one(&self, def: &Definition, keep_folders: bool) -> Result<Package, PkgError> {
        let lookup = def.clone();
        let pkg = self
            .store_op(move |store| store.find_by_definition(&lookup))
            .await
            .map_err(PkgError::internal)?
            .ok_or(PkgError::NotInstalled)?;

        let profile = &self.ctx.profile;
        let mut trash = TrashBatch::new(self.runtime.clone(), &profile.trash_dir(&self.ctx.global));
        if !keep_folders {
            for folder in &pkg.folders {
                if let Err(e) = trash.move_aside(&profile.addon_path(folder)) {
                    trash.restore().map_err(PkgError::internal)?;
                    return Err(PkgError::internal(e));
                }
            }
        }

        let (source, id) = (pkg.source.clone(), pkg.id.clone());
        if let Err(e) = self.store_op(move |store| store.delete(&source, &id)).await {
            trash.restore().map_err(PkgError::internal)?;
            return Err(PkgError::internal(e));
        }

        trash.commit();
        info!("Removed {}", pkg.to_ref());
        Ok(pkg)
    }
}
