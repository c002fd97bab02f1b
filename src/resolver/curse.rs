//! CurseForge as an add-on source.
//!
//! Needs an API key. Numeric aliases are fetched in one bulk request; slugs
//! are searched for individually.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::future::join_all;
use log::debug;
use reqwest::Url;
use serde::Deserialize;

use crate::config::{CFCORE_API_KEY_ENV, Flavour};
use crate::definition::{Definition, Strategy, StrategyTag};
use crate::error::PkgError;
use crate::http::JsonRequest;
use crate::package::{Package, PackageOptions};

use super::{Resolver, ResolverContext, SourceMetadata, request_error};

const DEFAULT_API_URL: &str = "https://api.curseforge.com";
const API_TTL: Duration = Duration::from_secs(5 * 60);
const WOW_GAME_ID: &str = "1";
const FILES_PAGE_SIZE: &str = "50";

const RELEASE: u8 = 1;
const BETA: u8 = 2;
const REQUIRED_DEPENDENCY: u8 = 3;

static METADATA: SourceMetadata = SourceMetadata {
    id: "curse",
    name: "CurseForge",
    strategies: &[
        StrategyTag::Default,
        StrategyTag::Latest,
        StrategyTag::Beta,
        StrategyTag::AnyFlavour,
        StrategyTag::Version,
    ],
};

mod api {
    use chrono::{DateTime, Utc};
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    pub struct Data<T> {
        pub data: T,
        #[serde(default)]
        pub pagination: Option<Pagination>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Pagination {
        pub index: u32,
        pub result_count: u32,
        pub total_count: u32,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Mod {
        pub id: u64,
        pub name: String,
        pub slug: String,
        #[serde(default)]
        pub summary: String,
        #[serde(default)]
        pub links: Links,
    }

    #[derive(Deserialize, Debug, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct Links {
        pub website_url: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct File {
        pub display_name: String,
        pub file_date: DateTime<Utc>,
        pub download_url: Option<String>,
        pub release_type: u8,
        #[serde(default)]
        pub sortable_game_versions: Vec<GameVersion>,
        #[serde(default)]
        pub dependencies: Vec<Dependency>,
        #[serde(default)]
        pub modules: Vec<Module>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct GameVersion {
        pub game_version_type_id: Option<u32>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct Dependency {
        pub mod_id: u64,
        pub relation_type: u8,
    }

    #[derive(Deserialize, Debug)]
    pub struct Module {
        pub name: String,
    }
}

/// Position of the newest file matching the strategy and flavour.
fn select_file(files: &[api::File], strategy: &Strategy, flavour: Flavour) -> Option<usize> {
    let flavour_id = flavour.curse_version_type_id();
    files
        .iter()
        .enumerate()
        .filter(|(_, f)| f.download_url.is_some())
        .filter(|(_, f)| match strategy {
            Strategy::Version(version) => f.display_name == *version,
            Strategy::Latest => true,
            Strategy::Beta => f.release_type == RELEASE || f.release_type == BETA,
            Strategy::Default | Strategy::AnyFlavour => f.release_type == RELEASE,
        })
        .filter(|(_, f)| {
            matches!(strategy, Strategy::AnyFlavour | Strategy::Version(_))
                || f.sortable_game_versions
                    .iter()
                    .any(|v| v.game_version_type_id == Some(flavour_id))
        })
        .max_by_key(|(_, f)| f.file_date)
        .map(|(i, _)| i)
}

fn numeric_id(def: &Definition) -> Option<u64> {
    def.id
        .as_deref()
        .unwrap_or(&def.alias)
        .parse()
        .ok()
}

fn api_key(ctx: &ResolverContext) -> Result<&str, PkgError> {
    ctx.global.access_tokens.cfcore.as_deref().ok_or_else(|| {
        PkgError::internal(anyhow!(
            "CurseForge requires an API key; set {} or add it to the config",
            CFCORE_API_KEY_ENV
        ))
    })
}

pub struct CurseResolver {
    api_url: String,
}

impl Default for CurseResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CurseResolver {
    pub fn new() -> Self {
        Self::with_api_url(DEFAULT_API_URL)
    }

    pub fn with_api_url(api_url: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_mods(
        &self,
        ctx: &ResolverContext,
        key: &str,
        ids: &BTreeSet<u64>,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let url = format!("{}/v1/mods", self.api_url);
        debug!("Fetching {} mods from {}...", ids.len(), url);
        let body = serde_json::json!({ "modIds": ids, "filterPcOnly": true });
        let response: api::Data<Vec<serde_json::Value>> = ctx
            .http
            .fetch_json(
                JsonRequest::post(&url, body)
                    .header("x-api-key", key)
                    .cache_for(API_TTL),
            )
            .await?;
        Ok(response.data)
    }

    async fn search_slug(
        &self,
        ctx: &ResolverContext,
        key: &str,
        slug: &str,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let url = format!("{}/v1/mods/search", self.api_url);
        let response: api::Data<Vec<serde_json::Value>> = ctx
            .http
            .fetch_json(
                JsonRequest::get(&url)
                    .query("gameId", WOW_GAME_ID)
                    .query("slug", slug)
                    .header("x-api-key", key)
                    .cache_for(API_TTL),
            )
            .await?;
        Ok(response
            .data
            .into_iter()
            .find(|m| m.get("slug").and_then(|s| s.as_str()) == Some(slug)))
    }

    /// One page of a mod's files, newest first, and the index of the next
    /// page when there is one.
    async fn fetch_files(
        &self,
        ctx: &ResolverContext,
        key: &str,
        mod_id: u64,
        index: u32,
    ) -> anyhow::Result<(Vec<api::File>, Option<u32>)> {
        let url = format!("{}/v1/mods/{}/files", self.api_url, mod_id);
        let response: api::Data<Vec<api::File>> = ctx
            .http
            .fetch_json(
                JsonRequest::get(&url)
                    .query("index", index.to_string())
                    .query("pageSize", FILES_PAGE_SIZE)
                    .header("x-api-key", key)
                    .cache_for(API_TTL),
            )
            .await?;
        let next = response.pagination.and_then(|page| {
            let next = page.index + page.result_count;
            (page.result_count > 0 && next < page.total_count).then_some(next)
        });
        Ok((response.data, next))
    }

    /// Looks for a file matching `strategy`. Only the version strategy pages
    /// past the newest files, since an older release can be asked for by name.
    async fn find_file(
        &self,
        ctx: &ResolverContext,
        key: &str,
        mod_id: u64,
        strategy: &Strategy,
    ) -> Result<Option<api::File>, PkgError> {
        let mut index = 0;
        loop {
            let (files, next) = self
                .fetch_files(ctx, key, mod_id, index)
                .await
                .map_err(request_error)?;
            if let Some(i) = select_file(&files, strategy, ctx.flavour()) {
                return Ok(files.into_iter().nth(i));
            }
            match next {
                Some(next) if matches!(strategy, Strategy::Version(_)) => {
                    debug!("No {} file before index {}", strategy, next);
                    index = next;
                }
                _ => return Ok(None),
            }
        }
    }

    async fn fetch_mod(
        &self,
        ctx: &ResolverContext,
        key: &str,
        def: &Definition,
    ) -> Result<serde_json::Value, PkgError> {
        let found = match numeric_id(def) {
            Some(id) => self
                .fetch_mods(ctx, key, &BTreeSet::from([id]))
                .await
                .map_err(request_error)?
                .into_iter()
                .next(),
            None => self
                .search_slug(ctx, key, &def.alias.to_lowercase())
                .await
                .map_err(request_error)?,
        };
        found.ok_or(PkgError::Nonexistent)
    }
}

fn find_mod<'a>(mods: &'a [serde_json::Value], id: u64) -> Option<&'a serde_json::Value> {
    mods.iter()
        .find(|m| m.get("id").and_then(|v| v.as_u64()) == Some(id))
}

#[async_trait]
impl Resolver for CurseResolver {
    fn metadata(&self) -> &SourceMetadata {
        &METADATA
    }

    fn get_alias_from_url(&self, url: &Url) -> Option<String> {
        if !matches!(url.host_str(), Some("curseforge.com" | "www.curseforge.com")) {
            return None;
        }
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        match (segments.next(), segments.next(), segments.next()) {
            (Some("wow"), Some("addons"), Some(slug)) => Some(slug.to_string()),
            _ => None,
        }
    }

    async fn resolve(
        &self,
        ctx: &ResolverContext,
        defs: &[Definition],
    ) -> Vec<Result<Package, PkgError>> {
        let key = match api_key(ctx) {
            Ok(key) => key,
            Err(e) => return defs.iter().map(|_| Err(e.clone())).collect(),
        };

        let ids: BTreeSet<u64> = defs.iter().filter_map(numeric_id).collect();
        let mods = if ids.is_empty() {
            Ok(vec![])
        } else {
            self.fetch_mods(ctx, key, &ids).await.map_err(request_error)
        };

        let slugs: BTreeSet<String> = defs
            .iter()
            .filter(|def| numeric_id(def).is_none())
            .map(|def| def.alias.to_lowercase())
            .collect();
        let searches = join_all(slugs.iter().map(|slug| async move {
            let found = self.search_slug(ctx, key, slug).await.map_err(request_error);
            (slug.clone(), found)
        }))
        .await;
        let searches: HashMap<String, Result<Option<serde_json::Value>, PkgError>> =
            searches.into_iter().collect();

        let mut results = Vec::with_capacity(defs.len());
        for def in defs {
            let metadata = match numeric_id(def) {
                Some(id) => match &mods {
                    Ok(mods) => find_mod(mods, id).cloned().ok_or(PkgError::Nonexistent),
                    Err(e) => Err(e.clone()),
                },
                None => match searches.get(&def.alias.to_lowercase()) {
                    Some(Ok(Some(found))) => Ok(found.clone()),
                    Some(Err(e)) => Err(e.clone()),
                    _ => Err(PkgError::Nonexistent),
                },
            };
            results.push(match metadata {
                Ok(metadata) => self.resolve_one(ctx, def, Some(metadata)).await,
                Err(e) => Err(e),
            });
        }
        results
    }

    #[tracing::instrument(skip(self, ctx, def, metadata), fields(def = %def))]
    async fn resolve_one(
        &self,
        ctx: &ResolverContext,
        def: &Definition,
        metadata: Option<serde_json::Value>,
    ) -> Result<Package, PkgError> {
        let key = api_key(ctx)?;
        let metadata = match metadata {
            Some(metadata) => metadata,
            None => self.fetch_mod(ctx, key, def).await?,
        };
        let addon: api::Mod = serde_json::from_value(metadata).map_err(PkgError::internal)?;

        let file = self
            .find_file(ctx, key, addon.id, &def.strategy)
            .await?
            .ok_or_else(|| {
                PkgError::FileUnavailable(format!(
                    "no {} file for {}",
                    def.strategy,
                    ctx.flavour()
                ))
            })?;
        let download_url = file
            .download_url
            .clone()
            .ok_or_else(|| PkgError::FileUnavailable("file has no download URL".into()))?;

        Ok(Package {
            source: METADATA.id.to_string(),
            id: addon.id.to_string(),
            url: addon
                .links
                .website_url
                .unwrap_or_else(|| format!("https://www.curseforge.com/wow/addons/{}", addon.slug)),
            slug: addon.slug,
            name: addon.name,
            description: addon.summary,
            download_url,
            date_published: file.file_date,
            version: file.display_name.clone(),
            folders: file.modules.iter().map(|m| m.name.clone()).collect(),
            options: PackageOptions {
                strategy: def.strategy.clone(),
            },
            deps: file
                .dependencies
                .iter()
                .filter(|d| d.relation_type == REQUIRED_DEPENDENCY)
                .map(|d| d.mod_id.to_string())
                .collect(),
        })
    }
}
