//! Environment variables and well-known directories.

use std::env;
use std::path::PathBuf;

use super::RealRuntime;

impl RealRuntime {
    #[tracing::instrument(skip(self))]
    pub(crate) fn env_var_impl(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn config_dir_impl(&self) -> Option<PathBuf> {
        dirs::config_dir()
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn cache_dir_impl(&self) -> Option<PathBuf> {
        dirs::cache_dir()
    }

    /// Falls back to the data dir on platforms without an XDG state dir.
    #[tracing::instrument(skip(self))]
    pub(crate) fn state_dir_impl(&self) -> Option<PathBuf> {
        dirs::state_dir().or_else(dirs::data_local_dir)
    }
}
