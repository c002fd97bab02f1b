//! Per-definition outcomes.
//!
//! Every failure resolving, installing, updating, removing or pinning a single
//! definition is a [`PkgError`] value returned next to that definition; none of
//! them abort the batch it belongs to.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

use crate::definition::Strategy;
use crate::package::PackageRef;

#[derive(Debug, Clone, Error)]
pub enum PkgError {
    #[error("package does not exist")]
    Nonexistent,

    #[error("no file available: {0}")]
    FileUnavailable(String),

    #[error("strategy '{0}' is not supported by this source")]
    StrategyUnsupported(Strategy),

    #[error("package already installed")]
    AlreadyInstalled,

    #[error("package folders conflict with installed package {0}")]
    ConflictsWithInstalled(PackageRef),

    #[error("package folders conflict with an add-on not managed by addonpm: {}", join(.0))]
    ConflictsWithUncontrolled(BTreeSet<String>),

    #[error("package is not installed")]
    NotInstalled,

    #[error("package is up to date")]
    UpToDate,

    #[error("invalid source")]
    SourceInvalid,

    #[error("internal error: {0:#}")]
    Internal(Arc<anyhow::Error>),
}

impl PkgError {
    pub fn internal(e: impl Into<anyhow::Error>) -> Self {
        PkgError::Internal(Arc::new(e.into()))
    }

    /// Short machine-friendly name, used by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            PkgError::Nonexistent => "nonexistent",
            PkgError::FileUnavailable(_) => "file-unavailable",
            PkgError::StrategyUnsupported(_) => "strategy-unsupported",
            PkgError::AlreadyInstalled => "already-installed",
            PkgError::ConflictsWithInstalled(_) => "conflicts-with-installed",
            PkgError::ConflictsWithUncontrolled(_) => "conflicts-with-uncontrolled",
            PkgError::NotInstalled => "not-installed",
            PkgError::UpToDate => "up-to-date",
            PkgError::SourceInvalid => "source-invalid",
            PkgError::Internal(_) => "internal-error",
        }
    }
}

fn join(folders: &BTreeSet<String>) -> String {
    folders.iter().cloned().collect::<Vec<_>>().join(", ")
}
