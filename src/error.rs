//! Typed failures of the tile lifecycle engine.
//!
//! Every variant renders as `<Label>: <context>: <os error text>` so the UI can
//! show both the taxonomy label and the underlying reason.

use std::path::{Path, PathBuf};

use crate::models::{BundleIdentity, ConfigId};

#[derive(Debug, thiserror::Error)]
pub enum TileError {
    #[error("ManifestReadFailed: {}: {reason}", path.display())]
    ManifestReadFailed { path: PathBuf, reason: String },

    #[error("ManifestWriteFailed: {}: {reason}", path.display())]
    ManifestWriteFailed { path: PathBuf, reason: String },

    #[error("BundleCopyFailed: {}: {reason}", path.display())]
    BundleCopyFailed { path: PathBuf, reason: String },

    #[error("SigningFailed: {}: {reason}", path.display())]
    SigningFailed { path: PathBuf, reason: String },

    #[error("RegistryReadFailed: {}: {reason}", path.display())]
    RegistryReadFailed { path: PathBuf, reason: String },

    #[error("RegistryWriteFailed: {}: {reason}", path.display())]
    RegistryWriteFailed { path: PathBuf, reason: String },

    /// Lookup of an identity that has no installed bundle. Callers treat this
    /// as a no-op signal, never as a user-visible failure.
    #[error("IdentityNotFound: {0}")]
    IdentityNotFound(BundleIdentity),

    /// Soft: logged, the install proceeds anyway.
    #[error("ProcessTerminationTimeout: {identity} still running after {attempts} checks")]
    ProcessTerminationTimeout {
        identity: BundleIdentity,
        attempts: u32,
    },

    /// Soft: the tile is installed, it just isn't running yet.
    #[error("LaunchFailed: {}: {reason}", path.display())]
    LaunchFailed { path: PathBuf, reason: String },

    #[error("IconRenderFailed: {reason}")]
    IconRenderFailed { reason: String },

    #[error("StoreReadFailed: {}: {reason}", path.display())]
    StoreReadFailed { path: PathBuf, reason: String },

    #[error("StoreWriteFailed: {}: {reason}", path.display())]
    StoreWriteFailed { path: PathBuf, reason: String },

    #[error("UnknownConfiguration: {0}")]
    UnknownConfiguration(ConfigId),

    #[error("InvalidConfiguration: {0}")]
    InvalidConfiguration(String),

    #[error("OperationInProgress: {0} is already being installed or removed")]
    OperationInProgress(BundleIdentity),

    #[error("EngineStopped: the lifecycle engine is no longer running")]
    EngineStopped,
}

impl TileError {
    /// Bare taxonomy label, e.g. `"SigningFailed"`.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ManifestReadFailed { .. } => "ManifestReadFailed",
            Self::ManifestWriteFailed { .. } => "ManifestWriteFailed",
            Self::BundleCopyFailed { .. } => "BundleCopyFailed",
            Self::SigningFailed { .. } => "SigningFailed",
            Self::RegistryReadFailed { .. } => "RegistryReadFailed",
            Self::RegistryWriteFailed { .. } => "RegistryWriteFailed",
            Self::IdentityNotFound(_) => "IdentityNotFound",
            Self::ProcessTerminationTimeout { .. } => "ProcessTerminationTimeout",
            Self::LaunchFailed { .. } => "LaunchFailed",
            Self::IconRenderFailed { .. } => "IconRenderFailed",
            Self::StoreReadFailed { .. } => "StoreReadFailed",
            Self::StoreWriteFailed { .. } => "StoreWriteFailed",
            Self::UnknownConfiguration(_) => "UnknownConfiguration",
            Self::InvalidConfiguration(_) => "InvalidConfiguration",
            Self::OperationInProgress(_) => "OperationInProgress",
            Self::EngineStopped => "EngineStopped",
        }
    }

    pub(crate) fn copy_failed(path: &Path, reason: impl ToString) -> Self {
        Self::BundleCopyFailed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn manifest_write(path: &Path, reason: impl ToString) -> Self {
        Self::ManifestWriteFailed {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

pub type TileResult<T> = Result<T, TileError>;
