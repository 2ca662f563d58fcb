//! Error taxonomy for the reconciliation core
//!
//! Errors are split by phase so callers can tell "fix your input"
//! (`ConfigError`, `PlanError`) apart from "fix your cluster"
//! (`ApplyError`). Config and plan errors are raised before any
//! provider call is made.

use crate::resource::ResourceKey;
use thiserror::Error;

/// Invalid or incomplete desired-state input. Pre-flight; no provider
/// calls have been made when one of these is returned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config: missing required field: {0}")]
    MissingField(String),

    #[error("config: missing secret {0} (set the environment variable)")]
    MissingSecret(String),

    #[error("config: invalid IPv4 address {value:?} for {resource}")]
    InvalidAddress { resource: String, value: String },

    #[error("config: vmid {vmid} is used by both {first:?} and {second:?}")]
    DuplicateVmId {
        vmid: u32,
        first: String,
        second: String,
    },

    #[error("config: duplicate resource {0}")]
    DuplicateResource(ResourceKey),

    #[error("config: {resource} depends on undefined resource {dependency:?}")]
    UnknownDependency {
        resource: ResourceKey,
        dependency: String,
    },

    #[error("config: {resource} dependency {dependency:?} matches more than one resource")]
    AmbiguousDependency {
        resource: ResourceKey,
        dependency: String,
    },

    #[error("no lab.kdl configuration file found")]
    FileNotFound,

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("config: IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The diff engine refused to produce a plan. Fatal; no provider calls
/// have been made.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("plan: circular dependency involving: {0}")]
    CircularDependency(String),
}

/// A failure surfaced while executing a plan. Always carries the
/// identity of the operation that failed.
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("apply: provider error for {key}: {source}")]
    Provider {
        key: ResourceKey,
        #[source]
        source: crate::provider::ProviderError,
    },

    #[error(transparent)]
    DuplicateExport(#[from] crate::exports::DuplicateExportError),

    #[error("apply: {resource} references {reference:?} which has not been applied")]
    UnresolvedReference {
        resource: ResourceKey,
        reference: String,
    },

    #[error("apply: plan replaces {0} destructively; re-run with approval to proceed")]
    DestructiveNotApproved(ResourceKey),

    #[error("apply: no provider registered under {0:?}")]
    UnknownProvider(String),
}

/// State file errors (load/save/lock of `.labwarden/state.json`).
#[derive(Error, Debug)]
pub enum StateError {
    #[error("state file version {found} is newer than supported version {supported}")]
    VersionMismatch { found: u32, supported: u32 },

    #[error("state is locked by {holder} since {since}")]
    Locked { holder: String, since: String },

    #[error("state IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
