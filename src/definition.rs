//! Definitions identify what to resolve and strategies say how.
//!
//! A definition is a `source:alias` reference, optionally carrying a known
//! source ID and a [`Strategy`].

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::package::Package;

/// Policy governing which file or version a resolver should select.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Strategy {
    /// Latest stable file for the active flavour.
    #[default]
    Default,
    /// Latest file of any release type (alphas, betas, pre-releases).
    Latest,
    /// Latest stable file, ignoring flavour compatibility.
    AnyFlavour,
    /// Release or beta files, never alphas.
    Beta,
    /// An exact version.
    Version(String),
}

impl Strategy {
    /// The strategy's tag, without any value.
    pub fn tag(&self) -> StrategyTag {
        match self {
            Strategy::Default => StrategyTag::Default,
            Strategy::Latest => StrategyTag::Latest,
            Strategy::AnyFlavour => StrategyTag::AnyFlavour,
            Strategy::Beta => StrategyTag::Beta,
            Strategy::Version(_) => StrategyTag::Version,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            Strategy::Version(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Version(v) => write!(f, "version={}", v),
            other => write!(f, "{}", other.tag()),
        }
    }
}

/// Error raised when a strategy string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyParseError {
    #[error("unknown strategy '{0}'; expected default, latest, any_flavour, beta or version=<v>")]
    UnknownTag(String),
    #[error("the version strategy needs a value, e.g. version=1.2.3")]
    MissingVersion,
}

impl FromStr for Strategy {
    type Err = StrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, value) = match s.split_once('=') {
            Some((tag, value)) => (tag, Some(value)),
            None => (s, None),
        };

        match (tag.trim().to_lowercase().as_str(), value) {
            ("default", None) => Ok(Strategy::Default),
            ("latest", None) => Ok(Strategy::Latest),
            ("any_flavour" | "any-flavour", None) => Ok(Strategy::AnyFlavour),
            ("beta", None) => Ok(Strategy::Beta),
            ("version", Some(v)) if !v.trim().is_empty() => Ok(Strategy::Version(v.trim().into())),
            ("version", _) => Err(StrategyParseError::MissingVersion),
            _ => Err(StrategyParseError::UnknownTag(s.to_string())),
        }
    }
}

/// Value-less strategy tag, used by resolvers to declare their support set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StrategyTag {
    Default,
    Latest,
    AnyFlavour,
    Beta,
    Version,
}

impl fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StrategyTag::Default => "default",
            StrategyTag::Latest => "latest",
            StrategyTag::AnyFlavour => "any_flavour",
            StrategyTag::Beta => "beta",
            StrategyTag::Version => "version",
        };
        f.write_str(s)
    }
}

/// Error raised when a definition string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid definition '{0}'; expected <source>:<alias> or a known add-on URL")]
pub struct DefinitionParseError(pub String);

/// A reference to a desired add-on.
///
/// Equality and hashing use the source, the ID when known (the alias
/// otherwise) and the strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub source: String,
    pub alias: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub strategy: Strategy,
}

impl Definition {
    pub fn new(source: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            alias: alias.into(),
            id: None,
            strategy: Strategy::Default,
        }
    }

    /// Derive a definition from an installed package, keeping its recorded strategy.
    pub fn from_pkg(pkg: &Package) -> Self {
        Self {
            source: pkg.source.clone(),
            alias: pkg.slug.clone(),
            id: Some(pkg.id.clone()),
            strategy: pkg.options.strategy.clone(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_strategy(&self, strategy: Strategy) -> Self {
        Self {
            strategy,
            ..self.clone()
        }
    }

    pub fn with_version(&self, version: impl Into<String>) -> Self {
        self.with_strategy(Strategy::Version(version.into()))
    }

    /// The ID if known, the alias otherwise.
    pub fn key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.alias)
    }
}

impl PartialEq for Definition {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.key() == other.key() && self.strategy == other.strategy
    }
}

impl Eq for Definition {}

impl Hash for Definition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
        self.key().hash(state);
        self.strategy.hash(state);
    }
}

impl PartialOrd for Definition {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Definition {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.source, self.key(), &self.strategy).cmp(&(&other.source, other.key(), &other.strategy))
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.alias)?;
        if self.strategy != Strategy::Default {
            write!(f, " ({})", self.strategy)?;
        }
        Ok(())
    }
}

/// Parses `source:alias`. URLs need a resolver registry, see
/// [`crate::resolver::ResolverRegistry::parse_definition`].
impl FromStr for Definition {
    type Err = DefinitionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((source, alias))
                if !source.is_empty() && !alias.is_empty() && !alias.starts_with("//") =>
            {
                Ok(Definition::new(source, alias))
            }
            _ => Err(DefinitionParseError(s.to_string())),
        }
    }
}
