//! Application layer - the package manager behind every command.
//!
//! [`Manager`] composes the resolvers, the archive extractor, the record
//! store and the lock registry for one profile. Each operation takes a batch
//! of definitions and returns one outcome per definition; only failures of
//! the machinery itself (store I/O, lock acquisition) abort a whole batch.

mod auth;
mod install;
mod pin;
mod reconcile;
mod remove;
mod update;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use log::{debug, error};
use tokio::sync::OwnedMutexGuard;

use crate::archive::{ArchiveExtractor, ArchiveExtractorImpl};
use crate::catalogue::Catalogue;
use crate::config::{GlobalConfig, ProfileConfig};
use crate::definition::Definition;
use crate::error::PkgError;
use crate::lock::{LockKey, LockRegistry};
use crate::package::{JsonPackageStore, Package, PackageStore};
use crate::resolver::{ResolverContext, ResolverRegistry};
use crate::runtime::Runtime;
use crate::tasks::BackgroundTasks;

pub use auth::GITHUB_AUTH_TASK;
pub use reconcile::{Candidate, MatchGroup, MatchReport};

/// One outcome per input definition, in input order.
pub type BatchResult<T> = Vec<(Definition, Result<T, PkgError>)>;

pub struct Manager<R: Runtime + 'static, E: ArchiveExtractor + 'static = ArchiveExtractorImpl> {
    runtime: Arc<R>,
    registry: ResolverRegistry,
    ctx: ResolverContext,
    locks: Arc<LockRegistry>,
    store: Arc<dyn PackageStore>,
    extractor: Arc<E>,
    catalogue: Arc<Catalogue>,
    tasks: BackgroundTasks,
}

impl<R: Runtime + 'static> Manager<R> {
    /// Manager for the profile in `ctx`, recording packages in the profile's
    /// `packages.json`.
    pub fn new(
        runtime: Arc<R>,
        registry: ResolverRegistry,
        ctx: ResolverContext,
        locks: Arc<LockRegistry>,
    ) -> Self {
        let store = JsonPackageStore::new(runtime.clone(), ctx.profile.packages_path(&ctx.global));
        Self {
            runtime,
            registry,
            ctx,
            locks,
            store: Arc::new(store),
            extractor: Arc::new(ArchiveExtractorImpl::new()),
            catalogue: Arc::new(Catalogue::default()),
            tasks: BackgroundTasks::new(),
        }
    }
}

impl<R: Runtime + 'static, E: ArchiveExtractor + 'static> Manager<R, E> {
    /// Swaps the archive extractor, keeping everything else.
    pub fn with_extractor<X: ArchiveExtractor + 'static>(self, extractor: X) -> Manager<R, X> {
        Manager {
            runtime: self.runtime,
            registry: self.registry,
            ctx: self.ctx,
            locks: self.locks,
            store: self.store,
            extractor: Arc::new(extractor),
            catalogue: self.catalogue,
            tasks: self.tasks,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn PackageStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_catalogue(mut self, catalogue: Catalogue) -> Self {
        self.catalogue = Arc::new(catalogue);
        self
    }

    pub fn registry(&self) -> &ResolverRegistry {
        &self.registry
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.ctx.global
    }

    pub fn profile(&self) -> &ProfileConfig {
        &self.ctx.profile
    }

    pub fn catalogue(&self) -> &Catalogue {
        &self.catalogue
    }

    /// Installed packages, as recorded.
    pub fn installed(&self) -> Result<Vec<Package>> {
        self.store.all()
    }

    /// Rebuilds the catalogue from every source and saves it to the cache.
    /// The running manager keeps matching against the catalogue it was
    /// created with.
    pub async fn refresh_catalogue(&self) -> Result<Catalogue> {
        let catalogue = Catalogue::build(&self.registry, &self.ctx).await?;
        let runtime = self.runtime.clone();
        let path = self.ctx.global.catalogue_path();
        let saved = catalogue.clone();
        blocking(move || saved.save(&*runtime, &path)).await?;
        Ok(catalogue)
    }

    /// Resolves a batch, optionally expanding dependencies by one round.
    ///
    /// Duplicates are kept. Dependencies that are not already part of the
    /// result are appended after the input definitions.
    #[tracing::instrument(skip(self, defs), fields(count = defs.len()))]
    pub async fn resolve(&self, defs: &[Definition], with_deps: bool) -> BatchResult<Package> {
        let mut results = self.resolve_batch(defs).await;
        if !with_deps {
            return results;
        }

        let mut known: HashSet<(String, String)> = defs
            .iter()
            .map(|d| (d.source.clone(), d.key().to_string()))
            .collect();
        for (_, result) in &results {
            if let Ok(pkg) = result {
                known.insert((pkg.source.clone(), pkg.id.clone()));
            }
        }

        let mut deps = Vec::new();
        for (_, result) in &results {
            let Ok(pkg) = result else { continue };
            for dep in &pkg.deps {
                if known.insert((pkg.source.clone(), dep.clone())) {
                    deps.push(Definition::new(&pkg.source, dep).with_id(dep));
                }
            }
        }

        if !deps.is_empty() {
            debug!("Resolving {} dependencies", deps.len());
            results.extend(self.resolve_batch(&deps).await);
        }
        results
    }

    /// Fans the batch out to one call per source and reassembles the
    /// results in input order.
    async fn resolve_batch(&self, defs: &[Definition]) -> BatchResult<Package> {
        let mut buckets: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, def) in defs.iter().enumerate() {
            buckets.entry(def.source.as_str()).or_default().push(i);
        }

        let mut results: Vec<Option<Result<Package, PkgError>>> = vec![None; defs.len()];
        let calls = buckets.iter().filter_map(|(source, positions)| {
            let resolver = self.registry.get(source)?;
            let bucket: Vec<Definition> = positions.iter().map(|&i| defs[i].clone()).collect();
            Some(async move { (positions, resolver.resolve(&self.ctx, &bucket).await) })
        });

        for (positions, resolved) in join_all(calls).await {
            for (&position, result) in positions.iter().zip(resolved) {
                results[position] = Some(result);
            }
        }

        defs.iter()
            .cloned()
            .zip(results)
            .map(|(def, result)| {
                let result = match result {
                    Some(result) => result,
                    None if !self.registry.has(&def.source) => Err(PkgError::SourceInvalid),
                    None => Err(PkgError::internal(anyhow::anyhow!(
                        "resolver for {} returned too few results",
                        def.source
                    ))),
                };
                log_internal(&def, &result);
                (def, result)
            })
            .collect()
    }

    async fn lock_profile(&self) -> Result<OwnedMutexGuard<()>> {
        self.locks
            .lock(LockKey::ProfileModify(self.ctx.profile.profile.clone()))
            .await
    }

    /// Runs a store operation off the async scheduler.
    async fn store_op<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PackageStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        blocking(move || f(store.as_ref())).await
    }
}

/// Runs blocking filesystem work on tokio's blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Blocking task panicked")?
}

fn log_internal<T>(def: &Definition, result: &Result<T, PkgError>) {
    if let Err(PkgError::Internal(e)) = result {
        error!("Internal error for {}: {:#}", def, e);
    }
}
