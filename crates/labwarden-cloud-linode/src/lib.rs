//! # labwarden-cloud-linode
//!
//! Linode adapter built on the `linode-cli` command line tool. Covers
//! the edge instance plus the NodeBalancer, its per-port configs and
//! backend nodes.
//!
//! Requires `linode-cli` to be installed and configured
//! (`pip install linode-cli && linode-cli configure`).

pub mod cli;
pub mod error;
pub mod provider;

pub use cli::{LinodeCli, TAG_PREFIX};
pub use error::{LinodeError, Result};
pub use provider::{LinodeProvider, PROVIDER_NAME};
