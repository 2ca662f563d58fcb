//! # labwarden-inventory
//!
//! Renders the cluster as an Ansible inventory so the configuration
//! half of the lab (k3s bootstrap playbooks) can pick up where
//! provisioning leaves off.
//!
//! Grouping follows the VM role: `server` hosts land in
//! `control_plane`, `agent` hosts in `workers`. Addresses come from the
//! export surface when an apply has run, falling back to the statically
//! configured IP.

use labwarden_core::{DesiredState, ExportSnapshot, ResourceKind};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Login user baked into the cloud-init image.
pub const ANSIBLE_USER: &str = "admin";

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, InventoryError>;

#[derive(Debug, Serialize)]
pub struct Inventory {
    pub all: Group,
}

#[derive(Debug, Serialize)]
pub struct Group {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, HostGroup>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct HostGroup {
    pub hosts: BTreeMap<String, Host>,
}

#[derive(Debug, Serialize)]
pub struct Host {
    pub ansible_host: String,
    pub ansible_user: String,
}

/// Build the inventory tree from the desired cluster and whatever the
/// last apply exported.
pub fn build_inventory(desired: &DesiredState, exports: &ExportSnapshot) -> Inventory {
    let mut control_plane: BTreeMap<String, Host> = BTreeMap::new();
    let mut workers: BTreeMap<String, Host> = BTreeMap::new();

    for spec in desired.resources() {
        if spec.kind != ResourceKind::Vm || spec.provider != "proxmox" {
            continue;
        }
        let role = spec
            .attributes
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("agent");

        let address = exports
            .get(&format!("vm.{}.ip", spec.name))
            .map(|s| s.to_string())
            .or_else(|| {
                spec.attributes
                    .get("ip")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            });

        let Some(address) = address else {
            tracing::warn!(vm = %spec.name, "no address known, leaving out of inventory");
            continue;
        };

        let host = Host {
            ansible_host: address,
            ansible_user: ANSIBLE_USER.to_string(),
        };
        if role == "server" {
            control_plane.insert(spec.name.clone(), host);
        } else {
            workers.insert(spec.name.clone(), host);
        }
    }

    let mut children = BTreeMap::new();
    children.insert("control_plane".to_string(), HostGroup { hosts: control_plane });
    children.insert("workers".to_string(), HostGroup { hosts: workers });

    let mut vars = BTreeMap::new();
    vars.insert("cluster_name".to_string(), desired.settings().name.clone());
    if let Some(control_plane_ip) = exports.get("controlPlaneIP") {
        vars.insert("control_plane_ip".to_string(), control_plane_ip.to_string());
    }

    Inventory {
        all: Group { children, vars },
    }
}

/// Inventory as a YAML document, ready for `ansible-playbook -i`.
pub fn render_inventory(desired: &DesiredState, exports: &ExportSnapshot) -> Result<String> {
    let inventory = build_inventory(desired, exports);
    Ok(serde_yaml::to_string(&inventory)?)
}
