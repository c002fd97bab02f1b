//! Builds the manager and its dependencies from a loaded [`Config`].

use std::sync::Arc;

use anyhow::Result;
use log::debug;
use reqwest::Client;

use crate::application::Manager;
use crate::catalogue::Catalogue;
use crate::http::HttpClient;
use crate::lock::LockRegistry;
use crate::resolver::{ResolverContext, ResolverRegistry};
use crate::runtime::Runtime;

use super::config::Config;

const USER_AGENT: &str = concat!("addonpm/", env!("ADDONPM_VERSION"));

/// HTTP client shared by every resolver. Source credentials are added per
/// request, not here.
pub fn build_http_client() -> Result<HttpClient> {
    let client = Client::builder().user_agent(USER_AGENT).build()?;
    Ok(HttpClient::new(client))
}

/// Manager over every built-in source, matching against the cached
/// catalogue.
pub fn build_manager<R: Runtime + 'static>(runtime: Arc<R>, config: Config) -> Result<Manager<R>> {
    let ctx = ResolverContext {
        http: build_http_client()?,
        global: Arc::new(config.global),
        profile: Arc::new(config.profile),
    };
    let catalogue = Catalogue::load(&*runtime, &ctx.global.catalogue_path())?;
    debug!("Loaded catalogue with {} entries", catalogue.len());

    Ok(Manager::new(
        runtime,
        ResolverRegistry::with_default_sources(),
        ctx,
        Arc::new(LockRegistry::new()),
    )
    .with_catalogue(catalogue))
}
