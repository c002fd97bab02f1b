use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::http::HttpClient;
use crate::runtime::Runtime;

/// Scratch path for the archive behind `url`.
///
/// The file name is the SHA-256 of the URL; the URL's extension is kept so
/// extractors can pick the right format.
pub fn archive_path(downloads_dir: &Path, url: &str) -> PathBuf {
    let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
    let path_part = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    let extension = if path_part.ends_with(".tar.gz") {
        ".tar.gz"
    } else if path_part.ends_with(".tgz") {
        ".tgz"
    } else {
        ".zip"
    };
    downloads_dir.join(format!("{}{}", digest, extension))
}

/// Downloads an archive into `downloads_dir`, reusing a previous download of
/// the same URL. Returns the archive's path.
#[tracing::instrument(skip(runtime, downloads_dir, http_client))]
pub async fn download_archive<R: Runtime>(
    runtime: &R,
    url: &str,
    downloads_dir: &Path,
    http_client: &HttpClient,
) -> Result<PathBuf> {
    let target = archive_path(downloads_dir, url);
    if runtime.exists(&target) {
        debug!("Reusing cached archive {:?}", target);
        return Ok(target);
    }

    info!("Downloading file from {}...", url);
    runtime.create_dir_all(downloads_dir)?;

    // Write to a partial file so an interrupted download is never reused
    let partial = target.with_extension("part");
    let result = http_client
        .download_file(url, || {
            runtime
                .create_file(&partial)
                .with_context(|| format!("Failed to create temporary file at {:?}", partial))
        })
        .await;

    if let Err(e) = result {
        if runtime.exists(&partial) {
            let _ = runtime.remove_file(&partial);
        }
        return Err(e);
    }

    runtime.rename(&partial, &target)?;
    info!("Download complete.");
    Ok(target)
}
