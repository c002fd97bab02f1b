//! HTTP client with response caching and status classification.
//!
//! Requests are never retried here: a failed request is returned to the
//! caller, which decides whether to try again.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use log::debug;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;

use super::cache::ResponseCache;
use super::status::classify_error;

/// Description of a JSON request, built fluently.
#[derive(Debug, Clone)]
pub struct JsonRequest<'a> {
    method: Method,
    url: &'a str,
    query: Vec<(&'a str, String)>,
    headers: Vec<(&'static str, String)>,
    body: Option<serde_json::Value>,
    ttl: Option<Duration>,
}

impl<'a> JsonRequest<'a> {
    pub fn get(url: &'a str) -> Self {
        Self {
            method: Method::GET,
            url,
            query: vec![],
            headers: vec![],
            body: None,
            ttl: None,
        }
    }

    pub fn post(url: &'a str, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: &'a str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    /// Serve this request from the cache for up to `ttl`.
    pub fn cache_for(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn cache_key(&self) -> String {
        let url = if self.query.is_empty() {
            self.url.to_string()
        } else {
            let query: Vec<String> = self
                .query
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            format!("{}?{}", self.url, query.join("&"))
        };
        let body = self.body.as_ref().map(|b| b.to_string());
        ResponseCache::key(self.method.as_str(), &url, body.as_deref())
    }
}

/// HTTP client shared by every resolver.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    cache: ResponseCache,
}

impl HttpClient {
    /// Creates a new HTTP client wrapping the given reqwest Client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: ResponseCache::new(),
        }
    }

    /// Returns the response cache, e.g. to invalidate it.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Sends a JSON request, consulting the response cache when the request
    /// carries a TTL.
    #[tracing::instrument(skip(self, request), fields(url = request.url))]
    pub async fn fetch_json<T: DeserializeOwned>(&self, request: JsonRequest<'_>) -> Result<T> {
        let cache_key = request.ttl.map(|_| request.cache_key());

        if let Some(key) = &cache_key
            && let Some(body) = self.cache.get(key).await
        {
            debug!("Cache hit for {}", key);
            return serde_json::from_str(&body)
                .with_context(|| format!("Failed to parse cached JSON for {}", request.url));
        }

        debug!("{} JSON from {}...", request.method, request.url);
        let response = self
            .build(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", request.url))?;
        let response = response.error_for_status().map_err(classify_error)?;
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        let parsed = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse JSON response from {}", request.url))?;

        if let (Some(key), Some(ttl)) = (cache_key, request.ttl) {
            self.cache.insert(key, body, ttl).await;
        }
        Ok(parsed)
    }

    fn build(&self, request: &JsonRequest<'_>) -> RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }

    /// Downloads a file from a URL through a writer produced by `create_writer`.
    /// Returns the number of bytes written.
    #[tracing::instrument(skip(self, create_writer))]
    pub async fn download_file<W, F>(&self, url: &str, create_writer: F) -> Result<u64>
    where
        W: Write,
        F: FnOnce() -> Result<W>,
    {
        debug!("Downloading file from {}...", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to start download request")?;

        let mut response = response.error_for_status().map_err(classify_error)?;

        let mut writer = create_writer()?;
        let mut downloaded_bytes: u64 = 0;

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read chunk from download stream")?
        {
            writer
                .write_all(&chunk)
                .context("Failed to write chunk to file")?;
            downloaded_bytes += chunk.len() as u64;
        }
        writer.flush().context("Failed to flush downloaded file")?;

        debug!(
            "Downloaded {:.2} MB",
            downloaded_bytes as f64 / (1024.0 * 1024.0)
        );

        Ok(downloaded_bytes)
    }
}
