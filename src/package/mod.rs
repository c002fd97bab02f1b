//! Resolved packages and their local record store.
//!
//! A [`Package`] is only ever created by a successful resolution and only
//! persisted by a successful install or update.

mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::Strategy;

pub use store::{JsonPackageStore, PackageStore};

/// Options recorded alongside an installed package.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageOptions {
    #[serde(default)]
    pub strategy: Strategy,
}

/// A resolved, installable add-on version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub source: String,
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    pub download_url: String,
    pub date_published: DateTime<Utc>,
    pub version: String,
    /// Top-level folders this package owns in the add-on directory.
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub options: PackageOptions,
    /// IDs of packages from the same source this one requires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
}

impl Package {
    pub fn to_ref(&self) -> PackageRef {
        PackageRef {
            source: self.source.clone(),
            id: self.id.clone(),
            slug: self.slug.clone(),
        }
    }

    /// Whether both packages point at the same downloadable file.
    pub fn same_file_as(&self, other: &Package) -> bool {
        self.version == other.version && self.download_url == other.download_url
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.options.strategy = strategy;
        self
    }
}

/// Lightweight handle naming an installed package.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageRef {
    pub source: String,
    pub id: String,
    pub slug: String,
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.slug)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::package;
    use super::*;

    #[test]
    fn test_package_ref_display() {
        let pkg = package("curse", "20338", "molinari", &["Molinari"]);
        assert_eq!(pkg.to_ref().to_string(), "curse:molinari");
    }

    #[test]
    fn test_same_file_as() {
        let a = package("curse", "1", "a", &["A"]);
        let mut b = a.clone();
        assert!(a.same_file_as(&b));

        b.version = "1.0.1".into();
        assert!(!a.same_file_as(&b));
    }

    #[test]
    fn test_package_serialization_defaults() {
        let json = r#"{
            "source": "wowi",
            "id": "13188",
            "slug": "molinari",
            "name": "Molinari",
            "url": "https://www.wowinterface.com/downloads/info13188",
            "download_url": "https://cdn.wowinterface.com/13188.zip",
            "date_published": "2024-01-01T00:00:00Z",
            "version": "10.0.0"
        }"#;
        let pkg: Package = serde_json::from_str(json).unwrap();
        assert!(pkg.folders.is_empty());
        assert!(pkg.deps.is_empty());
        assert_eq!(pkg.options.strategy, Strategy::Default);
    }
}
