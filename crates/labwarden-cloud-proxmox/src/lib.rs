//! Proxmox VE compute adapter
//!
//! Implements the labwarden [`Provider`](labwarden_core::Provider)
//! trait on top of the `pvesh` CLI: VMs are cloned from a cloud-init
//! template, customised (CPU, memory, disk, network, user-data) and
//! started.

pub mod cloudinit;
pub mod error;
pub mod provider;
pub mod pvesh;

pub use error::ProxmoxError;
pub use provider::{ProxmoxProvider, PROVIDER_NAME};
pub use pvesh::{CloneConfig, Pvesh, VmInfo};
