//! Add-on folders on disk and their TOC metadata.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use log::warn;
use regex::Regex;

use crate::config::Flavour;
use crate::runtime::Runtime;

const CURSE_ID_KEY: &str = "x-curse-project-id";
const WOWI_ID_KEY: &str = "x-wowi-id";
const TITLE_KEY: &str = "title";

fn colour_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\|c[0-9A-Fa-f]{8}|\|r").unwrap())
}

/// `## Key: Value` pairs of a TOC file. Keys are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toc {
    entries: HashMap<String, String>,
}

impl Toc {
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();
        for line in content.trim_start_matches('\u{feff}').lines() {
            let Some(rest) = line.strip_prefix("##") else {
                continue;
            };
            let Some((key, value)) = rest.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            if !key.is_empty() {
                // First occurrence wins
                entries.entry(key).or_insert_with(|| value.trim().to_string());
            }
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// The title with UI colour escapes stripped.
    pub fn title(&self) -> Option<String> {
        let title = colour_code_pattern().replace_all(self.get(TITLE_KEY)?, "");
        let title = title.trim();
        (!title.is_empty()).then(|| title.to_string())
    }

    pub fn curse_id(&self) -> Option<&str> {
        self.numeric(CURSE_ID_KEY)
    }

    pub fn wowi_id(&self) -> Option<&str> {
        self.numeric(WOWI_ID_KEY)
    }

    fn numeric(&self, key: &str) -> Option<&str> {
        self.get(key)
            .filter(|v| v.chars().all(|c| c.is_ascii_digit()))
    }
}

/// A top-level folder in the add-on directory. The TOC is read at most once.
#[derive(Debug, Clone)]
pub struct AddonFolder {
    pub name: String,
    pub path: PathBuf,
    flavour: Flavour,
    toc: OnceLock<Option<Toc>>,
}

impl AddonFolder {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, flavour: Flavour) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            flavour,
            toc: OnceLock::new(),
        }
    }

    pub fn toc<R: Runtime>(&self, runtime: &R) -> Option<&Toc> {
        self.toc.get_or_init(|| self.load_toc(runtime)).as_ref()
    }

    /// Flavour-specific TOC files first, then `<name>.toc`.
    fn toc_candidates(&self) -> Vec<PathBuf> {
        self.flavour
            .toc_suffixes()
            .iter()
            .map(|suffix| self.path.join(format!("{}{}.toc", self.name, suffix)))
            .chain(std::iter::once(self.path.join(format!("{}.toc", self.name))))
            .collect()
    }

    fn load_toc<R: Runtime>(&self, runtime: &R) -> Option<Toc> {
        let path = self
            .toc_candidates()
            .into_iter()
            .find(|p| runtime.exists(p))?;
        match runtime.read_to_string(&path) {
            Ok(content) => Some(Toc::parse(&content)),
            Err(e) => {
                warn!("Failed to read {:?}: {:#}", path, e);
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
