//! Global and per-profile configuration.
//!
//! The global config lives in `<config_dir>/config.json`; each profile has its
//! own `<config_dir>/profiles/<name>/config.json`. Environment variables
//! override the defaults and the stored tokens.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::{LockKey, LockRegistry};
use crate::runtime::Runtime;

pub const DEFAULT_PROFILE: &str = "__default__";

const APP_DIR_NAME: &str = "addonpm";
const CONFIG_FILE: &str = "config.json";

pub const CONFIG_DIR_ENV: &str = "ADDONPM_CONFIG_DIR";
pub const CACHE_DIR_ENV: &str = "ADDONPM_CACHE_DIR";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const CFCORE_API_KEY_ENV: &str = "CFCORE_API_KEY";

/// A game client variant.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Flavour {
    #[default]
    Retail,
    VanillaClassic,
    Classic,
}

impl Flavour {
    pub const ALL: [Flavour; 3] = [Flavour::Retail, Flavour::VanillaClassic, Flavour::Classic];

    /// Suffixes of flavour-specific TOC files, e.g. `Foo_Mainline.toc`.
    pub fn toc_suffixes(&self) -> &'static [&'static str] {
        match self {
            Flavour::Retail => &["_Mainline"],
            Flavour::VanillaClassic => &["_Vanilla", "_Classic"],
            Flavour::Classic => &["_Cata", "_Wrath"],
        }
    }

    /// CurseForge `gameVersionTypeId`.
    pub fn curse_version_type_id(&self) -> u32 {
        match self {
            Flavour::Retail => 517,
            Flavour::VanillaClassic => 67408,
            Flavour::Classic => 77522,
        }
    }

    /// Flavor names used in packager `release.json` manifests.
    pub fn release_json_names(&self) -> &'static [&'static str] {
        match self {
            Flavour::Retail => &["mainline"],
            Flavour::VanillaClassic => &["classic", "vanilla"],
            Flavour::Classic => &["cata", "wrath"],
        }
    }
}

impl fmt::Display for Flavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Flavour::Retail => "retail",
            Flavour::VanillaClassic => "vanilla_classic",
            Flavour::Classic => "classic",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown flavour '{0}'; expected retail, vanilla_classic or classic")]
pub struct FlavourParseError(String);

impl FromStr for Flavour {
    type Err = FlavourParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "retail" | "mainline" => Ok(Flavour::Retail),
            "vanilla_classic" | "vanilla" => Ok(Flavour::VanillaClassic),
            "classic" => Ok(Flavour::Classic),
            _ => Err(FlavourParseError(s.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfcore: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    #[serde(skip)]
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub state_dir: PathBuf,
    #[serde(default)]
    pub access_tokens: AccessTokens,
}

impl GlobalConfig {
    /// Defaults for this machine, with environment overrides applied.
    pub fn from_env<R: Runtime>(runtime: &R, config_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = match config_dir.or_else(|| runtime.env_var(CONFIG_DIR_ENV).ok().map(PathBuf::from)) {
            Some(dir) => dir,
            None => runtime
                .config_dir()
                .context("Could not determine the user config directory")?
                .join(APP_DIR_NAME),
        };
        let cache_dir = match runtime.env_var(CACHE_DIR_ENV).ok() {
            Some(dir) => PathBuf::from(dir),
            None => runtime
                .cache_dir()
                .map(|d| d.join(APP_DIR_NAME))
                .unwrap_or_else(|| config_dir.join("cache")),
        };
        let state_dir = runtime
            .state_dir()
            .map(|d| d.join(APP_DIR_NAME))
            .unwrap_or_else(|| config_dir.join("state"));

        let mut config = Self {
            config_dir,
            cache_dir,
            state_dir,
            access_tokens: AccessTokens::default(),
        };
        config.apply_env_tokens(runtime);
        Ok(config)
    }

    /// Reads the stored config, falling back to [`GlobalConfig::from_env`]
    /// when nothing is stored yet. Tokens from the environment win.
    #[tracing::instrument(skip(runtime))]
    pub fn read<R: Runtime>(runtime: &R, config_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::read_stored(runtime, config_dir)?;
        config.apply_env_tokens(runtime);
        Ok(config)
    }

    /// The stored config without environment tokens, so that writing it back
    /// never persists them.
    fn read_stored<R: Runtime>(runtime: &R, config_dir: Option<PathBuf>) -> Result<Self> {
        let mut defaults = Self::from_env(runtime, config_dir)?;
        defaults.access_tokens = AccessTokens::default();
        let path = defaults.config_path();
        if !runtime.exists(&path) {
            debug!("No global config at {:?}, using defaults", path);
            return Ok(defaults);
        }

        let content = runtime
            .read_to_string(&path)
            .with_context(|| format!("Failed to read global config from {:?}", path))?;
        let mut config: GlobalConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse global config in {:?}", path))?;
        config.config_dir = defaults.config_dir;
        if let Ok(dir) = runtime.env_var(CACHE_DIR_ENV) {
            config.cache_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Persists the config. Concurrent writers are serialised.
    pub async fn write<R: Runtime>(&self, runtime: &R, locks: &LockRegistry) -> Result<()> {
        let _guard = locks.lock(LockKey::GlobalConfig).await?;
        self.write_locked(runtime)
    }

    /// Re-reads the stored config, applies `f` and writes the result back,
    /// all under the global config lock.
    pub async fn update<R, F>(
        runtime: &R,
        locks: &LockRegistry,
        config_dir: Option<PathBuf>,
        f: F,
    ) -> Result<Self>
    where
        R: Runtime,
        F: FnOnce(&mut GlobalConfig),
    {
        let _guard = locks.lock(LockKey::GlobalConfig).await?;
        let mut config = Self::read_stored(runtime, config_dir)?;
        f(&mut config);
        config.write_locked(runtime)?;
        Ok(config)
    }

    fn write_locked<R: Runtime>(&self, runtime: &R) -> Result<()> {
        runtime.create_dir_all(&self.config_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        runtime
            .write(&self.config_path(), content.as_bytes())
            .with_context(|| format!("Failed to write global config to {:?}", self.config_path()))
    }

    fn apply_env_tokens<R: Runtime>(&mut self, runtime: &R) {
        if let Ok(token) = runtime.env_var(GITHUB_TOKEN_ENV) {
            self.access_tokens.github = Some(token);
        }
        if let Ok(key) = runtime.env_var(CFCORE_API_KEY_ENV) {
            self.access_tokens.cfcore = Some(key);
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.config_dir.join("profiles")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    pub fn catalogue_path(&self) -> PathBuf {
        self.cache_dir.join("catalogue.json")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProfileConfig {
    pub profile: String,
    pub addon_dir: PathBuf,
    #[serde(default)]
    pub game_flavour: Flavour,
}

impl ProfileConfig {
    pub fn new(profile: impl Into<String>, addon_dir: impl Into<PathBuf>, game_flavour: Flavour) -> Self {
        Self {
            profile: profile.into(),
            addon_dir: addon_dir.into(),
            game_flavour,
        }
    }

    fn config_path(global: &GlobalConfig, profile: &str) -> PathBuf {
        global.profiles_dir().join(profile).join(CONFIG_FILE)
    }

    #[tracing::instrument(skip(runtime, global))]
    pub fn read<R: Runtime>(runtime: &R, global: &GlobalConfig, profile: &str) -> Result<Self> {
        let path = Self::config_path(global, profile);
        let content = runtime
            .read_to_string(&path)
            .with_context(|| format!("Failed to read profile '{}' from {:?}", profile, path))?;
        let config: ProfileConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse profile config in {:?}", path))?;
        config.validate(runtime)?;
        Ok(config)
    }

    pub fn write<R: Runtime>(&self, runtime: &R, global: &GlobalConfig) -> Result<()> {
        let path = Self::config_path(global, &self.profile);
        if let Some(parent) = path.parent() {
            runtime.create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        runtime
            .write(&path, content.as_bytes())
            .with_context(|| format!("Failed to write profile config to {:?}", path))
    }

    /// The add-on directory must exist and be a directory.
    pub fn validate<R: Runtime>(&self, runtime: &R) -> Result<()> {
        if !runtime.is_dir(&self.addon_dir) {
            bail!(
                "Add-on directory {:?} of profile '{}' does not exist or is not a directory",
                self.addon_dir,
                self.profile
            );
        }
        Ok(())
    }

    pub fn state_dir(&self, global: &GlobalConfig) -> PathBuf {
        global.state_dir.join("profiles").join(&self.profile)
    }

    pub fn packages_path(&self, global: &GlobalConfig) -> PathBuf {
        self.state_dir(global).join("packages.json")
    }

    pub fn trash_dir(&self, global: &GlobalConfig) -> PathBuf {
        self.state_dir(global).join("trash")
    }

    pub fn addon_path(&self, folder: &str) -> PathBuf {
        self.addon_dir.join(folder)
    }
}
