//! Resolvers turn definitions into packages, one per hosting source.
//!
//! Every resolver is registered in a [`ResolverRegistry`], which wraps it so
//! that definitions with a strategy outside the resolver's declared support
//! set fail with [`PkgError::StrategyUnsupported`] before the resolver sees
//! them.

mod curse;
mod github;
mod registry;
mod wowi;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::{Flavour, GlobalConfig, ProfileConfig};
use crate::definition::{Definition, Strategy, StrategyTag};
use crate::error::PkgError;
use crate::http::{HttpClient, is_not_found};
use crate::package::Package;

pub use curse::CurseResolver;
pub use github::{DeviceCode, GitHubDeviceAuth, GitHubResolver};
pub use registry::ResolverRegistry;
pub use wowi::WowiResolver;

/// Static description of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMetadata {
    pub id: &'static str,
    pub name: &'static str,
    pub strategies: &'static [StrategyTag],
}

impl SourceMetadata {
    pub fn supports(&self, strategy: &Strategy) -> bool {
        self.strategies.contains(&strategy.tag())
    }
}

/// What a resolver needs from its caller on every call.
#[derive(Clone)]
pub struct ResolverContext {
    pub http: HttpClient,
    pub global: Arc<GlobalConfig>,
    pub profile: Arc<ProfileConfig>,
}

impl ResolverContext {
    pub fn flavour(&self) -> Flavour {
        self.profile.game_flavour
    }
}

/// One add-on as listed by a source's catalogue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CatalogueEntry {
    pub source: String,
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub flavours: BTreeSet<Flavour>,
    /// Each set is one combination of folders a release of this add-on ships.
    #[serde(default)]
    pub folders: Vec<BTreeSet<String>>,
    #[serde(default)]
    pub download_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl CatalogueEntry {
    pub fn to_definition(&self) -> Definition {
        Definition::new(&self.source, &self.slug).with_id(&self.id)
    }
}

#[async_trait]
pub trait Resolver: Send + Sync {
    fn metadata(&self) -> &SourceMetadata;

    /// Extracts an alias from one of this source's URL shapes.
    fn get_alias_from_url(&self, url: &Url) -> Option<String>;

    /// Resolves a batch; the result at each position belongs to the
    /// definition at the same position.
    async fn resolve(
        &self,
        ctx: &ResolverContext,
        defs: &[Definition],
    ) -> Vec<Result<Package, PkgError>> {
        join_all(defs.iter().map(|def| self.resolve_one(ctx, def, None))).await
    }

    /// Resolves one definition, optionally from already fetched metadata.
    async fn resolve_one(
        &self,
        ctx: &ResolverContext,
        def: &Definition,
        metadata: Option<serde_json::Value>,
    ) -> Result<Package, PkgError>;

    /// Lists this source's catalogue. Each call starts from scratch.
    fn collect_items<'a>(
        &'a self,
        _ctx: &'a ResolverContext,
    ) -> BoxStream<'a, anyhow::Result<CatalogueEntry>> {
        stream::empty().boxed()
    }

    fn supports_rollback(&self) -> bool {
        self.metadata().strategies.contains(&StrategyTag::Version)
    }
}

/// Maps a failed metadata request to a per-definition error.
pub(crate) fn request_error(e: anyhow::Error) -> PkgError {
    if is_not_found(&e) {
        PkgError::Nonexistent
    } else {
        PkgError::internal(e)
    }
}

/// Lowercase, dash-separated form of a display name.
pub(crate) fn slugify(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}
