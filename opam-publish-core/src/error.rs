//! Error types shared by the prepare and submit workflows.

use std::path::PathBuf;

use crate::contract::{ForgeError, GitError};
use crate::validate::ValidationReport;

/// Result alias used across the core crate.
pub type PublishResult<T> = Result<T, PublishError>;

/// Every way a prepare or submit run can stop.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("package name unspecified: pass --name or add a `name:` field to the archive's opam file")]
    MissingName,

    #[error("package version unspecified: pass --version or add a `version:` field to the archive's opam file")]
    MissingVersion,

    #[error("no opam file found for {package} in any metadata source")]
    NoManifest { package: String },

    #[error("could not download {url}: {reason}")]
    ArchiveUnavailable { url: String, reason: String },

    #[error("invalid package identifier {input:?}: {reason}")]
    InvalidPackage { input: String, reason: String },

    #[error("invalid repository {input:?}: {reason}")]
    InvalidRepo { input: String, reason: String },

    #[error("malformed metadata in {}: {reason}", path.display())]
    Metadata { path: PathBuf, reason: String },

    #[error("{} failed validation", report.bundle.display())]
    ValidationFailed { report: ValidationReport },

    #[error("{package} is already published in {label}: the bundle matches the repository")]
    AlreadyPublished { package: String, label: String },

    #[error("unknown repository label {label:?}: register it first with `opam-publish repo add {label} <owner/name>`")]
    UnknownLabel { label: String },

    #[error("repository label {label:?} is already bound to {existing}, refusing to rebind it to {requested}")]
    LabelRebind {
        label: String,
        existing: String,
        requested: String,
    },

    #[error("repository label {label:?} is bound to forge user {recorded:?}, not {requested:?}")]
    UserMismatch {
        label: String,
        recorded: String,
        requested: String,
    },

    #[error("fork {fork} did not become available after {attempts} attempts")]
    ForkTimeout { fork: String, attempts: u32 },

    #[error("unrecognised remote url {url:?} (expected host:owner/name)")]
    RemoteUrl { url: String },

    #[error(transparent)]
    Forge(#[from] ForgeError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("terminal interaction failed: {0}")]
    Interaction(String),

    #[error("aborted by operator")]
    Aborted,
}

impl PublishError {
    /// Wraps an I/O error with a short description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PublishError::Io {
            context: context.into(),
            source,
        }
    }
}
