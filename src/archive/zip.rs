use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use zip::ZipArchive;

use crate::runtime::Runtime;

use super::{ArchiveExtractor, is_member_of};

/// Extractor for .zip archives
pub struct ZipExtractor;

impl ZipExtractor {
    fn open<R: Runtime>(
        &self,
        runtime: &R,
        archive_path: &Path,
    ) -> Result<ZipArchive<Cursor<Vec<u8>>>> {
        let mut reader = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;

        // zip crate requires Read + Seek, but Runtime::open returns Box<dyn Read + Send>
        let mut buffer = Vec::new();
        reader
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read archive {:?}", archive_path))?;

        ZipArchive::new(Cursor::new(buffer)).with_context(|| "Failed to parse ZIP archive")
    }
}

impl ArchiveExtractor for ZipExtractor {
    fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".zip")
    }

    fn members<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
    ) -> Result<Vec<String>> {
        let archive = self.open(runtime, archive_path)?;
        Ok(archive.file_names().map(str::to_string).collect())
    }

    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
        base_dirs: &BTreeSet<String>,
    ) -> Result<()> {
        debug!("Extracting zip archive to {:?}...", extract_to);
        let mut archive = self.open(runtime, archive_path)?;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .with_context(|| format!("Failed to read ZIP entry {}", i))?;

            let entry_path = match entry.enclosed_name() {
                Some(path) if is_member_of(&path, base_dirs) => path,
                _ => {
                    debug!("Skipping entry outside add-on folders: {}", entry.name());
                    continue;
                }
            };

            let full_path = extract_to.join(&entry_path);

            if entry.is_dir() {
                runtime.create_dir_all(&full_path)?;
            } else {
                if let Some(parent) = full_path.parent() {
                    runtime.create_dir_all(parent)?;
                }
                let mut dest_file = runtime.create_file(&full_path)?;
                std::io::copy(&mut entry, &mut dest_file)
                    .with_context(|| format!("Failed to extract file {:?}", full_path))?;

                #[cfg(unix)]
                if let Some(mode) = entry.unix_mode()
                    && let Err(e) = runtime.set_permissions(&full_path, mode)
                {
                    debug!("Failed to set permissions on {:?}: {}", full_path, e);
                }
            }
        }

        info!("Extraction complete.");
        Ok(())
    }
}
