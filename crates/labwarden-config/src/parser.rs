//! KDL parser for `lab.kdl`

use crate::model::{ClusterConfig, EdgeConfig, LabConfig, VmDef};
use crate::model::{DEFAULT_BRIDGE, DEFAULT_DATASTORE};
use kdl::{KdlDocument, KdlNode};
use labwarden_core::ConfigError;
use std::fs;
use std::path::Path;

/// Parse a KDL file into a raw [`LabConfig`].
pub fn parse_kdl_file<P: AsRef<Path>>(path: P) -> Result<LabConfig, ConfigError> {
    let content = fs::read_to_string(path.as_ref())?;
    parse_kdl_string(&content)
}

/// Parse a KDL string.
pub fn parse_kdl_string(content: &str) -> Result<LabConfig, ConfigError> {
    let doc: KdlDocument = content
        .parse()
        .map_err(|e: kdl::KdlError| ConfigError::Parse(e.to_string()))?;

    let mut config = LabConfig::default();
    let mut saw_cluster = false;

    for node in doc.nodes() {
        match node.name().value() {
            "cluster" => {
                config.cluster = parse_cluster(node)?;
                saw_cluster = true;
            }
            "edge" => {
                config.edge = Some(parse_edge(node));
            }
            other => {
                tracing::debug!(node = other, "ignoring unknown top-level node");
            }
        }
    }

    if !saw_cluster {
        return Err(ConfigError::MissingField("cluster".to_string()));
    }

    Ok(config)
}

fn first_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn first_integer(node: &KdlNode) -> Option<i128> {
    node.entries().first().and_then(|e| e.value().as_integer())
}

/// `cluster` ノードをパース
fn parse_cluster(node: &KdlNode) -> Result<ClusterConfig, ConfigError> {
    let name = node
        .entries()
        .first()
        .and_then(|e| e.value().as_string())
        .ok_or_else(|| ConfigError::MissingField("cluster name".to_string()))?
        .to_string();

    let mut cluster = ClusterConfig {
        name,
        datastore: DEFAULT_DATASTORE.to_string(),
        bridge: DEFAULT_BRIDGE.to_string(),
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "node" => {
                    cluster.node = first_string(child).unwrap_or_default();
                }
                "template_vmid" => {
                    cluster.template_vmid = first_integer(child).unwrap_or(0) as u32;
                }
                "datastore" => {
                    if let Some(v) = first_string(child) {
                        cluster.datastore = v;
                    }
                }
                "bridge" => {
                    if let Some(v) = first_string(child) {
                        cluster.bridge = v;
                    }
                }
                "gateway" => {
                    cluster.gateway = first_string(child).unwrap_or_default();
                }
                "dns" => {
                    cluster.dns = first_string(child).unwrap_or_default();
                }
                "ssh_public_key" => {
                    cluster.ssh_public_key = first_string(child).unwrap_or_default();
                }
                "vm" => {
                    cluster.vms.push(parse_vm(child)?);
                }
                other => {
                    tracing::debug!(node = other, "ignoring unknown cluster field");
                }
            }
        }
    }

    // DNS defaults to the gateway.
    if cluster.dns.is_empty() {
        cluster.dns = cluster.gateway.clone();
    }

    Ok(cluster)
}

/// `vm` ノードをパース
fn parse_vm(node: &KdlNode) -> Result<VmDef, ConfigError> {
    let name = node
        .entries()
        .first()
        .and_then(|e| e.value().as_string())
        .ok_or_else(|| ConfigError::MissingField("vm name".to_string()))?
        .to_string();

    let mut vm = VmDef {
        name,
        role: "agent".to_string(),
        cores: 1,
        memory_mb: 1024,
        disk_gb: 20,
        ..Default::default()
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "role" => {
                    if let Some(v) = first_string(child) {
                        vm.role = v;
                    }
                }
                "vmid" => {
                    vm.vmid = first_integer(child).unwrap_or(0) as u32;
                }
                "cores" => {
                    vm.cores = first_integer(child).unwrap_or(1) as u32;
                }
                "memory_mb" => {
                    vm.memory_mb = first_integer(child).unwrap_or(1024) as u32;
                }
                "disk_gb" => {
                    vm.disk_gb = first_integer(child).unwrap_or(20) as u32;
                }
                "ip" => {
                    vm.ip = first_string(child).unwrap_or_default();
                }
                other => {
                    tracing::debug!(node = other, "ignoring unknown vm field");
                }
            }
        }
    }

    Ok(vm)
}

/// `edge` ノードをパース。すべてのフィールドにデフォルトがある。
fn parse_edge(node: &KdlNode) -> EdgeConfig {
    let mut edge = EdgeConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "region" => {
                    if let Some(v) = first_string(child) {
                        edge.region = v;
                    }
                }
                "label" => {
                    if let Some(v) = first_string(child) {
                        edge.label = v;
                    }
                }
                "ssh_public_key" => {
                    edge.ssh_public_key = first_string(child);
                }
                "home_endpoint" => {
                    edge.home_endpoint = first_string(child);
                }
                "home_wg_public_key" => {
                    edge.home_wg_public_key = first_string(child);
                }
                "home_ingress_ip" => {
                    if let Some(v) = first_string(child) {
                        edge.home_ingress_ip = v;
                    }
                }
                other => {
                    tracing::debug!(node = other, "ignoring unknown edge field");
                }
            }
        }
    }

    edge
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
cluster "homelab" {
    node "pve"
    template_vmid 9000
    gateway "192.168.1.1"
    ssh_public_key "ssh-ed25519 AAAA test@lab"

    vm "k3s-master-01" {
        role "server"
        vmid 200
        cores 2
        memory_mb 4096
        disk_gb 40
        ip "192.168.1.100"
    }

    vm "k3s-worker-01" {
        vmid 201
        cores 4
        memory_mb 8192
        disk_gb 60
        ip "192.168.1.101"
    }
}

edge {
    home_endpoint "home.example.net"
    home_wg_public_key "wgpubkey="
}
"#;

    #[test]
    fn parses_cluster_and_vms() {
        let config = parse_kdl_string(SAMPLE).unwrap();
        assert_eq!(config.cluster.name, "homelab");
        assert_eq!(config.cluster.node, "pve");
        assert_eq!(config.cluster.template_vmid, 9000);
        assert_eq!(config.cluster.vms.len(), 2);

        let master = &config.cluster.vms[0];
        assert_eq!(master.role, "server");
        assert_eq!(master.vmid, 200);
        assert_eq!(master.ip, "192.168.1.100");

        // Role defaults to agent.
        assert_eq!(config.cluster.vms[1].role, "agent");
    }

    #[test]
    fn dns_defaults_to_gateway() {
        let config = parse_kdl_string(SAMPLE).unwrap();
        assert_eq!(config.cluster.dns, "192.168.1.1");
    }

    #[test]
    fn datastore_and_bridge_have_defaults() {
        let config = parse_kdl_string(SAMPLE).unwrap();
        assert_eq!(config.cluster.datastore, "local-lvm");
        assert_eq!(config.cluster.bridge, "vmbr0");
    }

    #[test]
    fn edge_defaults_applied() {
        let config = parse_kdl_string(SAMPLE).unwrap();
        let edge = config.edge.unwrap();
        assert_eq!(edge.region, "us-ord");
        assert_eq!(edge.label, "homelab-edge");
        assert_eq!(edge.home_ingress_ip, "192.168.1.200");
        assert_eq!(edge.home_endpoint.as_deref(), Some("home.example.net"));
    }

    #[test]
    fn missing_cluster_is_an_error() {
        let err = parse_kdl_string("edge { }").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn invalid_kdl_is_a_parse_error() {
        let err = parse_kdl_string("cluster \"x\" {").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
