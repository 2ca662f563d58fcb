//! Raw configuration structs as written in `lab.kdl`
//!
//! These are unvalidated: defaults are filled in by the parser, but
//! invariants (valid addresses, unique vmids, required fields) are only
//! checked when the structs are turned into a `DesiredState` by
//! [`crate::builder::build_desired_state`].

use serde::{Deserialize, Serialize};

pub const DEFAULT_DATASTORE: &str = "local-lvm";
pub const DEFAULT_BRIDGE: &str = "vmbr0";
pub const DEFAULT_EDGE_REGION: &str = "us-ord";
pub const DEFAULT_EDGE_LABEL: &str = "homelab-edge";
pub const DEFAULT_HOME_INGRESS_IP: &str = "192.168.1.200";

/// One VM definition inside the `cluster` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmDef {
    pub name: String,

    /// "server" (control plane) or "agent" (worker).
    pub role: String,

    /// Proxmox VM id. Unique across the cluster.
    pub vmid: u32,

    pub cores: u32,

    pub memory_mb: u32,

    pub disk_gb: u32,

    /// Static IPv4 address, without CIDR suffix.
    pub ip: String,
}

/// The `cluster` node: Proxmox-side settings plus the VM fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,

    /// Proxmox node hosting the VMs.
    pub node: String,

    /// VM id of the cloud-init template to clone.
    pub template_vmid: u32,

    pub datastore: String,

    pub bridge: String,

    pub gateway: String,

    /// Defaults to the gateway when omitted.
    pub dns: String,

    pub ssh_public_key: String,

    pub vms: Vec<VmDef>,
}

/// The optional `edge` node: Linode-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub region: String,

    pub label: String,

    /// Falls back to the cluster key when omitted.
    pub ssh_public_key: Option<String>,

    /// WireGuard endpoint of the home router (public IP or DDNS name).
    pub home_endpoint: Option<String>,

    pub home_wg_public_key: Option<String>,

    /// The ingress IP on the home network the tunnel forwards to.
    pub home_ingress_ip: String,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            region: DEFAULT_EDGE_REGION.to_string(),
            label: DEFAULT_EDGE_LABEL.to_string(),
            ssh_public_key: None,
            home_endpoint: None,
            home_wg_public_key: None,
            home_ingress_ip: DEFAULT_HOME_INGRESS_IP.to_string(),
        }
    }
}

/// Everything parsed out of one `lab.kdl`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    pub cluster: ClusterConfig,
    pub edge: Option<EdgeConfig>,
}

/// Secrets supplied out-of-band (environment, not the config file), so
/// desired-state construction stays free of side effects.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    /// Root password for the edge node. Required when `edge` is
    /// configured.
    pub edge_root_password: Option<String>,
}
