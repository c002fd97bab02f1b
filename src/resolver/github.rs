//! GitHub releases as an add-on source, plus the device authorisation flow
//! used to obtain an access token.

use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::Url;
use serde::Deserialize;

use crate::definition::{Definition, Strategy, StrategyTag};
use crate::error::PkgError;
use crate::http::{HttpClient, JsonRequest, is_not_found};
use crate::package::{Package, PackageOptions};

use super::{Resolver, ResolverContext, SourceMetadata, request_error};

const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_OAUTH_URL: &str = "https://github.com";
const API_TTL: Duration = Duration::from_secs(5 * 60);
const RELEASE_MANIFEST: &str = "release.json";

static METADATA: SourceMetadata = SourceMetadata {
    id: "github",
    name: "GitHub",
    strategies: &[
        StrategyTag::Default,
        StrategyTag::Latest,
        StrategyTag::AnyFlavour,
        StrategyTag::Version,
    ],
};

/// GitHub API response types (internal).
mod api {
    use chrono::{DateTime, Utc};
    use serde::Deserialize;

    #[derive(Deserialize, Debug)]
    pub struct Repo {
        pub full_name: String,
        pub name: String,
        pub description: Option<String>,
        pub html_url: String,
    }

    #[derive(Deserialize, Debug)]
    pub struct Release {
        pub tag_name: String,
        #[serde(default)]
        pub draft: bool,
        #[serde(default)]
        pub prerelease: bool,
        pub published_at: Option<DateTime<Utc>>,
        #[serde(default)]
        pub assets: Vec<Asset>,
    }

    #[derive(Deserialize, Debug)]
    pub struct Asset {
        pub name: String,
        #[serde(default)]
        pub content_type: String,
        pub browser_download_url: String,
    }

    /// Packager manifest listing which asset targets which flavour.
    #[derive(Deserialize, Debug)]
    pub struct Manifest {
        pub releases: Vec<ManifestRelease>,
    }

    #[derive(Deserialize, Debug)]
    pub struct ManifestRelease {
        pub filename: String,
        #[serde(default)]
        pub nolib: bool,
        #[serde(default)]
        pub metadata: Vec<ManifestFlavour>,
    }

    #[derive(Deserialize, Debug)]
    pub struct ManifestFlavour {
        pub flavor: String,
    }
}

pub struct GitHubResolver {
    api_url: String,
}

impl Default for GitHubResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// The release URL for `tag`, which may contain `/` or `#`.
fn tag_url(releases: &str, tag: &str) -> Result<String> {
    let mut url = Url::parse(releases).with_context(|| format!("Invalid API URL {}", releases))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Invalid API URL {}", releases))?
        .push("tags")
        .push(tag);
    Ok(url.to_string())
}

impl GitHubResolver {
    pub fn new() -> Self {
        Self::with_api_url(DEFAULT_API_URL)
    }

    pub fn with_api_url(api_url: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn request<'a>(&self, ctx: &ResolverContext, url: &'a str) -> JsonRequest<'a> {
        let request = JsonRequest::get(url)
            .header("Accept", "application/vnd.github+json")
            .cache_for(API_TTL);
        match &ctx.global.access_tokens.github {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn fetch_repo(&self, ctx: &ResolverContext, full_name: &str) -> Result<api::Repo> {
        let url = format!("{}/repos/{}", self.api_url, full_name);
        debug!("Fetching repo info from {}...", url);
        ctx.http.fetch_json(self.request(ctx, &url)).await
    }

    async fn find_release(
        &self,
        ctx: &ResolverContext,
        full_name: &str,
        strategy: &Strategy,
    ) -> Result<api::Release, PkgError> {
        let base = format!("{}/repos/{}/releases", self.api_url, full_name);
        let unavailable = |e: anyhow::Error, detail: String| {
            if is_not_found(&e) {
                PkgError::FileUnavailable(detail)
            } else {
                PkgError::internal(e)
            }
        };

        match strategy {
            Strategy::Version(tag) => {
                let url = tag_url(&base, tag).map_err(PkgError::internal)?;
                ctx.http
                    .fetch_json(self.request(ctx, &url))
                    .await
                    .map_err(|e| unavailable(e, format!("no release tagged {}", tag)))
            }
            Strategy::Latest => {
                let releases: Vec<api::Release> = ctx
                    .http
                    .fetch_json(self.request(ctx, &base).query("per_page", "10"))
                    .await
                    .map_err(|e| unavailable(e, "no releases".to_string()))?;
                releases
                    .into_iter()
                    .find(|r| !r.draft)
                    .ok_or_else(|| PkgError::FileUnavailable("no releases".to_string()))
            }
            _ => {
                let url = format!("{}/latest", base);
                ctx.http
                    .fetch_json(self.request(ctx, &url))
                    .await
                    .map_err(|e| unavailable(e, "no stable release".to_string()))
            }
        }
    }

    async fn pick_asset<'r>(
        &self,
        ctx: &ResolverContext,
        release: &'r api::Release,
        strategy: &Strategy,
    ) -> Result<&'r api::Asset, PkgError> {
        let Some(manifest_asset) = release.assets.iter().find(|a| a.name == RELEASE_MANIFEST) else {
            return release
                .assets
                .iter()
                .find(|a| a.content_type == "application/zip" || a.name.to_lowercase().ends_with(".zip"))
                .ok_or_else(|| {
                    PkgError::FileUnavailable(format!("release {} has no zip asset", release.tag_name))
                });
        };

        let manifest: api::Manifest = ctx
            .http
            .fetch_json(self.request(ctx, &manifest_asset.browser_download_url))
            .await
            .map_err(PkgError::internal)?;

        let flavour_names = ctx.flavour().release_json_names();
        let any_flavour = *strategy == Strategy::AnyFlavour;
        let entry = manifest
            .releases
            .iter()
            .filter(|r| !r.nolib)
            .find(|r| {
                any_flavour
                    || r.metadata
                        .iter()
                        .any(|m| flavour_names.contains(&m.flavor.as_str()))
            })
            .ok_or_else(|| {
                PkgError::FileUnavailable(format!(
                    "release {} has no file for {}",
                    release.tag_name,
                    ctx.flavour()
                ))
            })?;

        release
            .assets
            .iter()
            .find(|a| a.name == entry.filename)
            .ok_or_else(|| {
                PkgError::FileUnavailable(format!(
                    "release {} lists {} but does not ship it",
                    release.tag_name, entry.filename
                ))
            })
    }
}

#[async_trait]
impl Resolver for GitHubResolver {
    fn metadata(&self) -> &SourceMetadata {
        &METADATA
    }

    fn get_alias_from_url(&self, url: &Url) -> Option<String> {
        if !matches!(url.host_str(), Some("github.com" | "www.github.com")) {
            return None;
        }
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
        let owner = segments.next()?;
        let repo = segments.next()?;
        Some(format!("{}/{}", owner, repo.trim_end_matches(".git")))
    }

    #[tracing::instrument(skip(self, ctx, def, metadata), fields(def = %def))]
    async fn resolve_one(
        &self,
        ctx: &ResolverContext,
        def: &Definition,
        metadata: Option<serde_json::Value>,
    ) -> Result<Package, PkgError> {
        let full_name = def.id.as_deref().unwrap_or(&def.alias);
        match full_name.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {}
            _ => return Err(PkgError::Nonexistent),
        }

        let repo = match metadata {
            Some(value) => serde_json::from_value(value).map_err(PkgError::internal)?,
            None => self
                .fetch_repo(ctx, full_name)
                .await
                .map_err(request_error)?,
        };
        let release = self.find_release(ctx, &repo.full_name, &def.strategy).await?;
        let asset = self.pick_asset(ctx, &release, &def.strategy).await?;

        debug!(
            "Resolved {} to {} ({}, prerelease: {})",
            def, asset.name, release.tag_name, release.prerelease
        );
        Ok(Package {
            source: METADATA.id.to_string(),
            id: repo.full_name.clone(),
            slug: repo.full_name.to_lowercase(),
            name: repo.name,
            description: repo.description.unwrap_or_default(),
            url: repo.html_url,
            download_url: asset.browser_download_url.clone(),
            date_published: release.published_at.unwrap_or_default(),
            version: release.tag_name.clone(),
            folders: vec![],
            options: PackageOptions {
                strategy: def.strategy.clone(),
            },
            deps: vec![],
        })
    }
}

/// Codes returned when starting the device flow.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    interval: Option<u64>,
}

/// OAuth device authorisation against GitHub.
pub struct GitHubDeviceAuth {
    http: HttpClient,
    base_url: String,
    client_id: String,
}

impl GitHubDeviceAuth {
    pub fn new(http: HttpClient, client_id: impl Into<String>) -> Self {
        Self::with_base_url(http, client_id, DEFAULT_OAUTH_URL)
    }

    pub fn with_base_url(http: HttpClient, client_id: impl Into<String>, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.into(),
        }
    }

    pub async fn request_device_code(&self) -> Result<DeviceCode> {
        let url = format!("{}/login/device/code", self.base_url);
        self.http
            .fetch_json(
                JsonRequest::post(&url, serde_json::json!({ "client_id": self.client_id }))
                    .header("Accept", "application/json"),
            )
            .await
            .context("Failed to request a device code from GitHub")
    }

    /// Polls until the user approves the code, the code expires or the
    /// request is denied. Returns the access token.
    #[tracing::instrument(skip(self, code))]
    pub async fn poll_for_token(&self, code: &DeviceCode) -> Result<String> {
        let url = format!("{}/login/oauth/access_token", self.base_url);
        let deadline = Instant::now() + Duration::from_secs(code.expires_in);
        let mut interval = Duration::from_secs(code.interval);

        loop {
            tokio::time::sleep(interval).await;
            if Instant::now() > deadline {
                bail!("The device code expired before it was approved");
            }

            let response: TokenResponse = self
                .http
                .fetch_json(
                    JsonRequest::post(
                        &url,
                        serde_json::json!({
                            "client_id": self.client_id,
                            "device_code": code.device_code,
                            "grant_type": "urn:ietf:params:oauth:grant-type:device_code",
                        }),
                    )
                    .header("Accept", "application/json"),
                )
                .await
                .context("Failed to poll GitHub for an access token")?;

            if let Some(token) = response.access_token {
                info!("GitHub access token obtained");
                return Ok(token);
            }
            match response.error.as_deref() {
                Some("authorization_pending") => debug!("Authorisation pending"),
                Some("slow_down") => {
                    interval = Duration::from_secs(response.interval.unwrap_or(interval.as_secs() + 5));
                    debug!("Slowing down polling to {:?}", interval);
                }
                Some(error) => bail!(
                    "GitHub refused the device code: {} {}",
                    error,
                    response.error_description.unwrap_or_default()
                ),
                None => bail!("GitHub returned neither a token nor an error"),
            }
        }
    }
}
