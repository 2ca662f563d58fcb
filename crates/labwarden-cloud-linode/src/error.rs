//! Linode adapter error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinodeError {
    #[error("linode-cli not found. Please install: pip install linode-cli")]
    CliNotFound,

    #[error("linode-cli command failed: {0}")]
    CommandFailed(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("unsupported resource kind for linode: {0}")]
    UnsupportedKind(String),

    #[error("missing attribute {0} on spec")]
    MissingAttribute(&'static str),

    #[error("cannot derive a port from lb-config name {0:?}")]
    UnknownPort(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinodeError>;

impl From<LinodeError> for labwarden_core::ProviderError {
    fn from(err: LinodeError) -> Self {
        labwarden_core::ProviderError::new(err.to_string())
    }
}
