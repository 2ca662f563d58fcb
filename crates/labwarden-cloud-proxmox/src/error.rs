//! Proxmox adapter error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxmoxError {
    #[error("pvesh not found. Run labwarden on the Proxmox node or install proxmox-ve")]
    PveshNotFound,

    #[error("pvesh command failed: {0}")]
    CommandFailed(String),

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("unsupported resource kind for proxmox: {0}")]
    UnsupportedKind(String),

    #[error("missing attribute {0} on VM spec")]
    MissingAttribute(&'static str),

    #[error("cloud-init template error: {0}")]
    Template(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxmoxError>;

impl From<ProxmoxError> for labwarden_core::ProviderError {
    fn from(err: ProxmoxError) -> Self {
        labwarden_core::ProviderError::new(err.to_string())
    }
}
