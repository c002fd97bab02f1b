//! Pinning installed packages to their current version.

use log::info;

use crate::definition::{Definition, Strategy};
use crate::error::PkgError;
use crate::package::Package;
use crate::archive::ArchiveExtractor;
use crate::runtime::Runtime;

use super::{BatchResult, Manager, log_internal};

impl<R: Runtime + 'static, E: ArchiveExtractor + 'static> Manager<R, E> {
    /// Records a version strategy for the installed version, or with `undo`
    /// the default strategy. Files are never touched.
    #[tracing::instrument(skip(self, defs), fields(count = defs.len()))]
    pub async fn pin(&self, defs: &[Definition], undo: bool) -> anyhow::Result<BatchResult<Package>> {
        let _guard = self.lock_profile().await?;

        let mut results = Vec::with_capacity(defs.len());
        for def in defs {
            let outcome = self.pin_one(def, undo).await;
            log_internal(def, &outcome);
            results.push((def.clone(), outcome));
        }
        Ok(results)
    }

    async fn pin_one(&self, def: &Definition, undo: bool) -> Result<Package, PkgError> {
        let lookup = def.clone();
        let pkg = self
            .store_op(move |store| store.find_by_definition(&lookup))
            .await
            .map_err(PkgError::internal)?
            .ok_or(PkgError::NotInstalled)?;

        let strategy = if undo {
            Strategy::Default
        } else {
            let resolver = self.registry.get(&pkg.source).ok_or(PkgError::SourceInvalid)?;
            let strategy = Strategy::Version(pkg.version.clone());
            if !resolver.supports_rollback() {
                return Err(PkgError::StrategyUnsupported(strategy));
            }
            strategy
        };

        let pinned = pkg.clone().with_strategy(strategy);
        let (old, new) = (pkg, pinned.clone());
        self.store_op(move |store| store.replace(&old, &new))
            .await
            .map_err(PkgError::internal)?;
        info!("{} {} is now {}", pinned.to_ref(), pinned.version, pinned.options.strategy);
        Ok(pinned)
    }
}
