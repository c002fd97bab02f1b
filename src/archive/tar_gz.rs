use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info};
use tar::{Archive, EntryType};

use crate::runtime::Runtime;

use super::{ArchiveExtractor, is_member_of};

/// Extractor for .tar.gz / .tgz archives
pub struct TarGzExtractor;

impl ArchiveExtractor for TarGzExtractor {
    fn can_handle(&self, archive_path: &Path) -> bool {
        let name = archive_path.to_string_lossy().to_lowercase();
        name.ends_with(".tar.gz") || name.ends_with(".tgz")
    }

    fn members<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
    ) -> Result<Vec<String>> {
        let file = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        let mut archive = Archive::new(GzDecoder::new(file));

        let mut members = Vec::new();
        for entry in archive.entries().context("Failed to read tar entries")? {
            let entry = entry.context("Failed to read tar entry")?;
            let mut name = entry.path()?.to_string_lossy().replace('\\', "/");
            if entry.header().entry_type() == EntryType::Directory && !name.ends_with('/') {
                name.push('/');
            }
            members.push(name);
        }
        Ok(members)
    }

    fn extract<R: Runtime + 'static>(
        &self,
        runtime: &R,
        archive_path: &Path,
        extract_to: &Path,
        base_dirs: &BTreeSet<String>,
    ) -> Result<()> {
        debug!("Extracting tar.gz archive to {:?}...", extract_to);
        let file = runtime
            .open(archive_path)
            .with_context(|| format!("Failed to open archive at {:?}", archive_path))?;
        let mut archive = Archive::new(GzDecoder::new(file));

        for entry in archive.entries().context("Failed to read tar entries")? {
            let mut entry = entry.context("Failed to read tar entry")?;
            let entry_path = entry.path()?.into_owned();
            let entry_path = entry_path.strip_prefix("./").unwrap_or(&entry_path).to_path_buf();

            if !is_member_of(&entry_path, base_dirs) {
                debug!("Skipping entry outside add-on folders: {:?}", entry_path);
                continue;
            }

            let full_path = extract_to.join(&entry_path);
            match entry.header().entry_type() {
                EntryType::Directory => runtime.create_dir_all(&full_path)?,
                EntryType::Regular | EntryType::Continuous => {
                    if let Some(parent) = full_path.parent() {
                        runtime.create_dir_all(parent)?;
                    }
                    let mut dest_file = runtime.create_file(&full_path)?;
                    std::io::copy(&mut entry, &mut dest_file)
                        .with_context(|| format!("Failed to extract file {:?}", full_path))?;

                    #[cfg(unix)]
                    if let Ok(mode) = entry.header().mode()
                        && let Err(e) = runtime.set_permissions(&full_path, mode)
                    {
                        debug!("Failed to set permissions on {:?}: {}", full_path, e);
                    }
                }
                other => debug!("Skipping {:?} entry {:?}", other, entry_path),
            }
        }

        info!("Extraction complete.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::base_dirs;
    use crate::runtime::RealRuntime;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn create_test_archive(path: &Path, files: &[(&str, &str)]) -> Result<()> {
        let file = File::create(path)?;
        let enc = GzEncoder::new(file, Compression::default());
        let mut tar = tar::Builder::new(enc);

        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_path(name)?;
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append(&header, content.as_bytes())?;
        }

        tar.into_inner()?.finish()?;
        Ok(())
    }

    #[test]
    fn test_can_handle_tar_gz() {
        let extractor = TarGzExtractor;
        assert!(extractor.can_handle(Path::new("file.tar.gz")));
        assert!(extractor.can_handle(Path::new("file.TGZ")));
        assert!(!extractor.can_handle(Path::new("file.zip")));
    }

    #[test]
    fn test_members_and_extract() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("test.tar.gz");
        let extract_path = dir.path().join("AddOns");
        fs::create_dir(&extract_path)?;

        create_test_archive(
            &archive_path,
            &[("Foo/Foo.toc", "## Title: Foo"), ("notes.txt", "loose")],
        )?;

        let members = TarGzExtractor.members(&RealRuntime, &archive_path)?;
        let dirs = base_dirs(&members);
        assert_eq!(dirs, BTreeSet::from(["Foo".to_string()]));

        TarGzExtractor.extract(&RealRuntime, &archive_path, &extract_path, &dirs)?;

        assert_eq!(
            fs::read_to_string(extract_path.join("Foo/Foo.toc"))?,
            "## Title: Foo"
        );
        assert!(!extract_path.join("notes.txt").exists());
        Ok(())
    }

    /// Writes the name straight into the header, bypassing the builder's
    /// path checks.
    fn append_raw(tar: &mut tar::Builder<GzEncoder<File>>, name: &str, content: &str) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        let raw = &mut header.as_gnu_mut().context("gnu header")?.name;
        raw[..name.len()].copy_from_slice(name.as_bytes());
        header.set_entry_type(EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, content.as_bytes())?;
        Ok(())
    }

    #[test]
    fn test_extract_never_leaves_add_on_folders() -> Result<()> {
        let dir = tempdir()?;
        let archive_path = dir.path().join("evil.tar.gz");
        let extract_path = dir.path().join("a/AddOns");
        fs::create_dir_all(&extract_path)?;

        let mut tar = tar::Builder::new(GzEncoder::new(File::create(&archive_path)?, Compression::default()));
        append_raw(&mut tar, "Foo/Foo.toc", "## Title: Foo")?;
        append_raw(&mut tar, "Foo/../../escaped.txt", "out")?;
        append_raw(&mut tar, "Foo/../Bar/planted.lua", "out")?;
        tar.into_inner()?.finish()?;

        let members = TarGzExtractor.members(&RealRuntime, &archive_path)?;
        let dirs = base_dirs(&members);
        assert_eq!(dirs, BTreeSet::from(["Foo".to_string()]));

        TarGzExtractor.extract(&RealRuntime, &archive_path, &extract_path, &dirs)?;

        assert!(extract_path.join("Foo/Foo.toc").exists());
        assert!(!dir.path().join("a/escaped.txt").exists());
        assert!(!extract_path.join("Bar").exists());
        Ok(())
    }

    #[test]
    fn test_corrupted_archive() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("test.tar.gz");
        fs::write(&archive_path, "corrupted data").unwrap();

        assert!(TarGzExtractor.members(&RealRuntime, &archive_path).is_err());
    }
}
