//! HTTP client module with response caching and error classification.

mod cache;
mod client;
mod status;

pub use cache::ResponseCache;
pub use client::{HttpClient, JsonRequest};
pub use status::{HttpError, classify_error, is_not_found};
