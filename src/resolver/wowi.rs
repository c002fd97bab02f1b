//! WoWInterface as an add-on source.
//!
//! File details are looked up in bulk: one request covers every definition in
//! a batch.

use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use log::debug;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Deserializer};

use crate::config::Flavour;
use crate::definition::{Definition, StrategyTag};
use crate::error::PkgError;
use crate::http::JsonRequest;
use crate::package::{Package, PackageOptions};

use super::{CatalogueEntry, Resolver, ResolverContext, SourceMetadata, request_error, slugify};

const DEFAULT_API_URL: &str = "https://api.mmoui.com/v3/game/WOW";
const DETAILS_TTL: Duration = Duration::from_secs(5 * 60);

static METADATA: SourceMetadata = SourceMetadata {
    id: "wowi",
    name: "WoWInterface",
    strategies: &[StrategyTag::Default],
};

mod api {
    use super::*;

    #[derive(Deserialize, Debug)]
    pub struct FileDetails {
        #[serde(rename = "UID")]
        pub uid: String,
        #[serde(rename = "UIName")]
        pub name: String,
        #[serde(rename = "UIVersion")]
        pub version: String,
        #[serde(rename = "UIDate", deserialize_with = "from_millis")]
        pub date: DateTime<Utc>,
        #[serde(rename = "UIDownload")]
        pub download_url: String,
        #[serde(rename = "UIDescription", default)]
        pub description: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct ListItem {
        #[serde(rename = "UID")]
        pub uid: String,
        #[serde(rename = "UIName")]
        pub name: String,
        #[serde(rename = "UIDir", default)]
        pub dirs: Vec<String>,
        #[serde(rename = "UIDownloadTotal", default, deserialize_with = "lenient_u64")]
        pub download_total: u64,
        #[serde(rename = "UIDate", deserialize_with = "from_millis")]
        pub date: DateTime<Utc>,
        #[serde(rename = "UICompatibility", default)]
        pub compatibility: Option<Vec<Compatibility>>,
    }

    #[derive(Deserialize, Debug)]
    pub struct Compatibility {
        pub version: String,
    }
}

/// Counts arrive as numbers or numeric strings.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn from_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let millis = lenient_u64(deserializer)?;
    DateTime::from_timestamp_millis(millis as i64)
        .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", millis)))
}

fn alias_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)(?:-(.+))?$").unwrap())
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^/downloads/(?:info|download)(\d+)(?:-([^/]+?))?(?:\.html)?/?$").unwrap()
    })
}

/// The numeric ID in `13188` or `13188-molinari`.
fn parse_id(def: &Definition) -> Option<String> {
    if let Some(id) = &def.id {
        return Some(id.clone());
    }
    alias_pattern()
        .captures(&def.alias)
        .map(|c| c[1].to_string())
}

/// Flavour from a game version string such as `1.15.2` or `11.0.2`.
fn flavour_of_version(version: &str) -> Flavour {
    match version.split('.').next().and_then(|m| m.parse::<u32>().ok()) {
        Some(1) => Flavour::VanillaClassic,
        Some(2..=5) => Flavour::Classic,
        _ => Flavour::Retail,
    }
}

pub struct WowiResolver {
    api_url: String,
}

impl Default for WowiResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl WowiResolver {
    pub fn new() -> Self {
        Self::with_api_url(DEFAULT_API_URL)
    }

    pub fn with_api_url(api_url: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_details(
        &self,
        ctx: &ResolverContext,
        ids: &BTreeSet<String>,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let joined: Vec<&str> = ids.iter().map(String::as_str).collect();
        let url = format!("{}/filedetails/{}.json", self.api_url, joined.join(","));
        debug!("Fetching file details from {}...", url);
        ctx.http
            .fetch_json(JsonRequest::get(&url).cache_for(DETAILS_TTL))
            .await
    }
}

fn find_by_uid<'a>(details: &'a [serde_json::Value], id: &str) -> Option<&'a serde_json::Value> {
    details
        .iter()
        .find(|item| item.get("UID").and_then(|v| v.as_str()) == Some(id))
}

#[async_trait]
impl Resolver for WowiResolver {
    fn metadata(&self) -> &SourceMetadata {
        &METADATA
    }

    fn get_alias_from_url(&self, url: &Url) -> Option<String> {
        let host = url.host_str()?;
        if host != "wowinterface.com" && !host.ends_with(".wowinterface.com") {
            return None;
        }
        if url.path() == "/downloads/fileinfo.php" {
            return url
                .query_pairs()
                .find(|(k, _)| k == "id")
                .map(|(_, v)| v.into_owned())
                .filter(|id| id.chars().all(|c| c.is_ascii_digit()) && !id.is_empty());
        }
        let captures = url_pattern().captures(url.path())?;
        Some(match captures.get(2) {
            Some(slug) => format!("{}-{}", &captures[1], slug.as_str()),
            None => captures[1].to_string(),
        })
    }

    async fn resolve(
        &self,
        ctx: &ResolverContext,
        defs: &[Definition],
    ) -> Vec<Result<Package, PkgError>> {
        let ids: Vec<Option<String>> = defs.iter().map(parse_id).collect();
        let unique: BTreeSet<String> = ids.iter().flatten().cloned().collect();
        if unique.is_empty() {
            return defs.iter().map(|_| Err(PkgError::Nonexistent)).collect();
        }

        let details = match self.fetch_details(ctx, &unique).await {
            Ok(details) => details,
            Err(e) => {
                let error = request_error(e);
                return defs.iter().map(|_| Err(error.clone())).collect();
            }
        };

        let mut results = Vec::with_capacity(defs.len());
        for (def, id) in defs.iter().zip(ids) {
            let item = id.as_deref().and_then(|id| find_by_uid(&details, id));
            results.push(match item {
                Some(item) => self.resolve_one(ctx, def, Some(item.clone())).await,
                None => Err(PkgError::Nonexistent),
            });
        }
        results
    }

    async fn resolve_one(
        &self,
        ctx: &ResolverContext,
        def: &Definition,
        metadata: Option<serde_json::Value>,
    ) -> Result<Package, PkgError> {
        let id = parse_id(def).ok_or(PkgError::Nonexistent)?;
        let metadata = match metadata {
            Some(metadata) => metadata,
            None => {
                let details = self
                    .fetch_details(ctx, &BTreeSet::from([id.clone()]))
                    .await
                    .map_err(request_error)?;
                find_by_uid(&details, &id)
                    .cloned()
                    .ok_or(PkgError::Nonexistent)?
            }
        };
        let details: api::FileDetails =
            serde_json::from_value(metadata).map_err(PkgError::internal)?;

        let slug = alias_pattern()
            .captures(&def.alias)
            .and_then(|c| c.get(2).map(|s| s.as_str().to_lowercase()))
            .unwrap_or_else(|| slugify(&details.name));

        Ok(Package {
            source: METADATA.id.to_string(),
            url: format!("https://www.wowinterface.com/downloads/info{}", details.uid),
            id: details.uid,
            slug,
            name: details.name,
            description: details.description,
            download_url: details.download_url,
            date_published: details.date,
            version: details.version,
            folders: vec![],
            options: PackageOptions {
                strategy: def.strategy.clone(),
            },
            deps: vec![],
        })
    }

    fn collect_items<'a>(
        &'a self,
        ctx: &'a ResolverContext,
    ) -> BoxStream<'a, anyhow::Result<CatalogueEntry>> {
        let url = format!("{}/filelist.json", self.api_url);
        stream::once(async move {
            debug!("Fetching catalogue from {}...", url);
            ctx.http.fetch_json::<Vec<api::ListItem>>(JsonRequest::get(&url)).await
        })
        .flat_map(|result| {
            stream::iter(match result {
                Ok(items) => items
                    .into_iter()
                    .map(|item| Ok(CatalogueEntry::from(item)))
                    .collect::<Vec<anyhow::Result<CatalogueEntry>>>(),
                Err(e) => vec![Err(e)],
            })
        })
        .boxed()
    }
}

impl From<api::ListItem> for CatalogueEntry {
    fn from(item: api::ListItem) -> Self {
        let mut flavours: BTreeSet<Flavour> = item
            .compatibility
            .unwrap_or_default()
            .iter()
            .map(|c| flavour_of_version(&c.version))
            .collect();
        if flavours.is_empty() {
            flavours.insert(Flavour::Retail);
        }
        CatalogueEntry {
            source: METADATA.id.to_string(),
            slug: slugify(&item.name),
            id: item.uid,
            name: item.name,
            flavours,
            folders: vec![item.dirs.into_iter().collect()],
            download_count: item.download_total,
            last_updated: item.date,
        }
    }
}
