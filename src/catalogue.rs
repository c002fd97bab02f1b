//! Snapshot of every add-on the catalogue-capable sources list.
//!
//! The matcher consults it to map folder names and add-on titles back to
//! definitions. It is built by draining each resolver's `collect_items`
//! stream and cached as JSON under the cache dir.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::Flavour;
use crate::resolver::{CatalogueEntry, ResolverContext, ResolverRegistry};
use crate::runtime::Runtime;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalogue {
    #[serde(default)]
    pub built_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<CatalogueEntry>,
}

impl Catalogue {
    pub fn new(entries: Vec<CatalogueEntry>) -> Self {
        Self {
            built_at: Some(Utc::now()),
            entries,
        }
    }

    /// Loads a saved catalogue; a missing file is an empty catalogue.
    pub fn load<R: Runtime>(runtime: &R, path: &Path) -> Result<Self> {
        if !runtime.exists(path) {
            debug!("No catalogue at {:?}", path);
            return Ok(Self::default());
        }
        let content = runtime
            .read_to_string(path)
            .with_context(|| format!("Failed to read catalogue from {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalogue in {:?}", path))
    }

    pub fn save<R: Runtime>(&self, runtime: &R, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            runtime.create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("json.tmp");
        runtime.write(&temp_path, serde_json::to_string(self)?.as_bytes())?;
        runtime
            .rename(&temp_path, path)
            .with_context(|| format!("Failed to save catalogue to {:?}", path))
    }

    /// Collects the entries of every registered source.
    #[tracing::instrument(skip(registry, ctx))]
    pub async fn build(registry: &ResolverRegistry, ctx: &ResolverContext) -> Result<Self> {
        let mut entries = Vec::new();
        for (source, resolver) in registry.iter() {
            let mut items = resolver.collect_items(ctx);
            let before = entries.len();
            while let Some(item) = items.next().await {
                entries.push(
                    item.with_context(|| format!("Failed to collect the {} catalogue", source))?,
                );
            }
            debug!("Collected {} entries from {}", entries.len() - before, source);
        }
        info!("Built catalogue with {} entries", entries.len());
        Ok(Self::new(entries))
    }

    /// Entries compatible with `flavour`.
    pub fn for_flavour(&self, flavour: Flavour) -> impl Iterator<Item = &CatalogueEntry> {
        self.entries
            .iter()
            .filter(move |e| e.flavours.contains(&flavour))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
