//! Raw config -> validated DesiredState
//!
//! This is the validation step of the pipeline: everything the file
//! format cannot express (well-formed addresses, unique vmids, required
//! secrets) is enforced here, before any planning or provider work.

use crate::model::{ClusterConfig, EdgeConfig, LabConfig, Secrets, VmDef};
use labwarden_core::{
    ConfigError, DesiredState, GlobalSettings, ResourceKind, ResourceSpec,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

pub const PROXMOX_PROVIDER: &str = "proxmox";
pub const LINODE_PROVIDER: &str = "linode";

/// Name of the Linode edge instance resource.
pub const EDGE_NODE: &str = "edge-node";
/// Name of the NodeBalancer resource.
pub const EDGE_LB: &str = "edge-lb";

/// Validate `config` and produce the immutable desired state.
///
/// Pure: reads nothing from the environment; secrets come in through
/// `secrets`.
pub fn build_desired_state(
    config: &LabConfig,
    secrets: &Secrets,
) -> Result<DesiredState, ConfigError> {
    let cluster = &config.cluster;

    if cluster.ssh_public_key.is_empty() {
        return Err(ConfigError::MissingField("cluster.ssh_public_key".to_string()));
    }
    parse_ip("cluster.gateway", &cluster.gateway)?;
    parse_ip("cluster.dns", &cluster.dns)?;

    let mut vmids: BTreeMap<u32, &str> = BTreeMap::new();
    for vm in &cluster.vms {
        parse_ip(&format!("vm {}", vm.name), &vm.ip)?;
        if let Some(first) = vmids.insert(vm.vmid, vm.name.as_str()) {
            return Err(ConfigError::DuplicateVmId {
                vmid: vm.vmid,
                first: first.to_string(),
                second: vm.name.clone(),
            });
        }
    }

    let settings = GlobalSettings {
        name: cluster.name.clone(),
        node_name: cluster.node.clone(),
        template_vmid: cluster.template_vmid,
        datastore: cluster.datastore.clone(),
        bridge: cluster.bridge.clone(),
        gateway: cluster.gateway.clone(),
        dns_server: cluster.dns.clone(),
        ssh_public_key: cluster.ssh_public_key.clone(),
        region: config
            .edge
            .as_ref()
            .map(|e| e.region.clone())
            .unwrap_or_default(),
    };

    let mut builder = DesiredState::builder(settings);

    for vm in &cluster.vms {
        builder = builder.resource(vm_spec(cluster, vm));
    }

    if let Some(edge) = &config.edge {
        let root_password = secrets
            .edge_root_password
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                ConfigError::MissingSecret("LABWARDEN_EDGE_ROOT_PASSWORD".to_string())
            })?;
        parse_ip("edge.home_ingress_ip", &edge.home_ingress_ip)?;

        for spec in edge_specs(cluster, edge, root_password) {
            builder = builder.resource(spec);
        }
    }

    builder.build()
}

fn parse_ip(field: &str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| ConfigError::InvalidAddress {
            resource: field.to_string(),
            value: value.to_string(),
        })
}

/// One Proxmox VM, cloned from the cloud-init template.
fn vm_spec(cluster: &ClusterConfig, vm: &VmDef) -> ResourceSpec {
    let mut spec = ResourceSpec::new(ResourceKind::Vm, &vm.name, PROXMOX_PROVIDER)
        .with_attribute("node", cluster.node.clone())
        .with_attribute("template_vmid", cluster.template_vmid)
        .with_attribute("datastore", cluster.datastore.clone())
        .with_attribute("bridge", cluster.bridge.clone())
        .with_attribute("vmid", vm.vmid)
        .with_attribute("role", vm.role.clone())
        .with_attribute("cores", vm.cores)
        .with_attribute("memory_mb", vm.memory_mb)
        .with_attribute("disk_gb", vm.disk_gb)
        .with_attribute("ip", vm.ip.clone())
        .with_attribute("gateway", cluster.gateway.clone())
        .with_attribute("dns", cluster.dns.clone())
        .with_attribute("ssh_public_key", cluster.ssh_public_key.clone())
        .with_attribute("tags", json!(["k3s", "rocky9", vm.role]))
        .export(format!("vm.{}.ip", vm.name), "ip");

    if vm.role == "server" {
        spec = spec.export("controlPlaneIP", "ip");
    }
    spec
}

/// The Linode edge: Nanode + NodeBalancer + per-port configs + backends.
///
/// Traffic flow: Internet -> NodeBalancer -> edge node (nginx) ->
/// WireGuard -> home ingress.
fn edge_specs(cluster: &ClusterConfig, edge: &EdgeConfig, root_password: &str) -> Vec<ResourceSpec> {
    let ssh_key = edge
        .ssh_public_key
        .clone()
        .unwrap_or_else(|| cluster.ssh_public_key.clone());

    let mut specs = Vec::new();

    specs.push(
        ResourceSpec::new(ResourceKind::Vm, EDGE_NODE, LINODE_PROVIDER)
            .with_attribute("label", edge.label.clone())
            .with_attribute("image", "linode/rocky9")
            .with_attribute("region", edge.region.clone())
            .with_attribute("type", "g6-nanode-1")
            .with_attribute("authorized_keys", json!([ssh_key]))
            .with_attribute("root_password", root_password)
            .with_attribute("private_ip_enabled", true)
            .with_attribute("home_endpoint", json!(edge.home_endpoint))
            .with_attribute("home_wg_public_key", json!(edge.home_wg_public_key))
            .with_attribute("home_ingress_ip", edge.home_ingress_ip.clone())
            .with_attribute("tags", json!(["homelab", "edge", "wireguard"]))
            .export("edgeNodeIP", "ip_address")
            .export("edgeNodePrivateIP", "private_ip")
            .export("edgeNodeRegion", "region"),
    );

    specs.push(
        ResourceSpec::new(ResourceKind::LoadBalancer, EDGE_LB, LINODE_PROVIDER)
            .with_attribute("label", format!("{}-lb", edge.label))
            .with_attribute("region", edge.region.clone())
            .with_attribute("client_conn_throttle", 20)
            .with_attribute("tags", json!(["homelab", "edge"]))
            .export("nodeBalancerHostname", "hostname")
            .export("nodeBalancerIPv4", "ipv4"),
    );

    for (suffix, port) in [("https", 443u16), ("http", 80u16)] {
        let config_name = format!("{EDGE_LB}-{suffix}");

        // TCP passthrough: TLS terminates at the home ingress, so
        // cert-manager keeps owning the certificates.
        specs.push(
            ResourceSpec::new(ResourceKind::LbConfig, &config_name, LINODE_PROVIDER)
                .with_attribute("nodebalancer", format!("${{{EDGE_LB}.id}}"))
                .with_attribute("port", port)
                .with_attribute("protocol", "tcp")
                .with_attribute("algorithm", "roundrobin")
                .with_attribute("check", "connection")
                .with_attribute("check_interval", 30)
                .with_attribute("check_timeout", 10)
                .with_attribute("check_attempts", 3)
                .with_attribute("stickiness", "table")
                .depends_on(EDGE_LB),
        );

        specs.push(
            ResourceSpec::new(
                ResourceKind::LbNode,
                format!("edge-backend-{suffix}"),
                LINODE_PROVIDER,
            )
            .with_attribute("nodebalancer", format!("${{{EDGE_LB}.id}}"))
            .with_attribute("config", format!("${{{config_name}.id}}"))
            .with_attribute("label", format!("edge-backend-{suffix}"))
            .with_attribute("address", format!("${{{EDGE_NODE}.private_ip}}:{port}"))
            .with_attribute("weight", 100)
            .depends_on(config_name)
            .depends_on(EDGE_NODE),
        );
    }

    specs
}

#[cfg(test)]
mod tests {
    use super::*;
    use labwarden_core::ResourceKey;

    fn sample_config() -> LabConfig {
        LabConfig {
            cluster: ClusterConfig {
                name: "homelab".to_string(),
                node: "pve".to_string(),
                template_vmid: 9000,
                datastore: "local-lvm".to_string(),
                bridge: "vmbr0".to_string(),
                gateway: "192.168.1.1".to_string(),
                dns: "192.168.1.1".to_string(),
                ssh_public_key: "ssh-ed25519 AAAA test@lab".to_string(),
                vms: vec![
                    VmDef {
                        name: "k3s-master-01".to_string(),
                        role: "server".to_string(),
                        vmid: 200,
                        cores: 2,
                        memory_mb: 4096,
                        disk_gb: 40,
                        ip: "192.168.1.100".to_string(),
                    },
                    VmDef {
                        name: "k3s-worker-01".to_string(),
                        role: "agent".to_string(),
                        vmid: 201,
                        cores: 4,
                        memory_mb: 8192,
                        disk_gb: 60,
                        ip: "192.168.1.101".to_string(),
                    },
                ],
            },
            edge: Some(EdgeConfig::default()),
        }
    }

    fn secrets() -> Secrets {
        Secrets {
            edge_root_password: Some("hunter2hunter2".to_string()),
        }
    }

    #[test]
    fn builds_full_fleet() {
        let state = build_desired_state(&sample_config(), &secrets()).unwrap();
        // 2 cluster VMs + edge node + LB + 2 configs + 2 backends
        assert_eq!(state.resources().len(), 8);
        assert!(state.contains(&ResourceKey::new(ResourceKind::Vm, "edge-node")));
        assert!(state.contains(&ResourceKey::new(ResourceKind::LoadBalancer, "edge-lb")));
    }

    #[test]
    fn backends_depend_on_config_and_edge_node() {
        let state = build_desired_state(&sample_config(), &secrets()).unwrap();
        let backend = state
            .get(&ResourceKey::new(ResourceKind::LbNode, "edge-backend-https"))
            .unwrap();
        assert!(backend.depends_on.contains("edge-lb-https"));
        assert!(backend.depends_on.contains("edge-node"));
        assert_eq!(
            backend.attributes.get("address"),
            Some(&json!("${edge-node.private_ip}:443"))
        );
    }

    #[test]
    fn control_plane_export_only_on_server_role() {
        let state = build_desired_state(&sample_config(), &secrets()).unwrap();
        let master = state
            .get(&ResourceKey::new(ResourceKind::Vm, "k3s-master-01"))
            .unwrap();
        let worker = state
            .get(&ResourceKey::new(ResourceKind::Vm, "k3s-worker-01"))
            .unwrap();
        assert!(master.exports.contains_key("controlPlaneIP"));
        assert!(!worker.exports.contains_key("controlPlaneIP"));
        assert!(worker.exports.contains_key("vm.k3s-worker-01.ip"));
    }

    #[test]
    fn missing_ssh_key_is_rejected() {
        let mut config = sample_config();
        config.cluster.ssh_public_key.clear();
        let err = build_desired_state(&config, &secrets()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn malformed_ip_is_rejected() {
        let mut config = sample_config();
        config.cluster.vms[0].ip = "192.168.1".to_string();
        let err = build_desired_state(&config, &secrets()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { .. }));
    }

    #[test]
    fn colliding_vmids_are_rejected() {
        let mut config = sample_config();
        config.cluster.vms[1].vmid = 200;
        let err = build_desired_state(&config, &secrets()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateVmId { vmid: 200, .. }));
    }

    #[test]
    fn edge_without_root_password_is_rejected() {
        let err = build_desired_state(&sample_config(), &Secrets::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret(_)));
    }

    #[test]
    fn no_edge_means_no_password_needed() {
        let mut config = sample_config();
        config.edge = None;
        let state = build_desired_state(&config, &Secrets::default()).unwrap();
        assert_eq!(state.resources().len(), 2);
    }
}
