//! Configuration the commands run with, assembled from CLI options and the
//! stored global and profile configs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;

use crate::config::{DEFAULT_PROFILE, Flavour, GlobalConfig, ProfileConfig};
use crate::runtime::Runtime;

/// Global CLI options.
#[derive(Debug, Clone)]
pub struct Options {
    pub config_dir: Option<PathBuf>,
    pub profile: String,
    pub addon_dir: Option<PathBuf>,
    pub flavour: Option<Flavour>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config_dir: None,
            profile: DEFAULT_PROFILE.to_string(),
            addon_dir: None,
            flavour: None,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub global: GlobalConfig,
    pub profile: ProfileConfig,
}

impl Config {
    /// Reads the global config and the selected profile. Passing an add-on
    /// directory (re)creates the profile with it.
    pub fn load<R: Runtime>(runtime: &R, options: &Options) -> Result<Self> {
        let global = GlobalConfig::read(runtime, options.config_dir.clone())?;

        let profile = match &options.addon_dir {
            Some(addon_dir) => {
                let profile = ProfileConfig::new(
                    &options.profile,
                    addon_dir,
                    options.flavour.unwrap_or_default(),
                );
                profile.validate(runtime)?;
                profile.write(runtime, &global)?;
                info!("Saved profile '{}' for {:?}", profile.profile, profile.addon_dir);
                profile
            }
            None => {
                let mut profile = ProfileConfig::read(runtime, &global, &options.profile)
                    .with_context(|| {
                        format!(
                            "Profile '{}' is not set up; pass --addon-dir to create it",
                            options.profile
                        )
                    })?;
                if let Some(flavour) = options.flavour {
                    profile.game_flavour = flavour;
                }
                profile
            }
        };

        Ok(Self { global, profile })
    }
}
