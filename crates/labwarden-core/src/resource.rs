//! Desired-state resource model
//!
//! A [`DesiredState`] is the validated, immutable target configuration of
//! the fleet: one [`ResourceSpec`] per resource, plus the global cluster
//! settings. It is built once per run through [`DesiredStateBuilder`],
//! which enforces the structural invariants (unique names per kind,
//! resolvable dependency references) before any planning happens.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Attribute map of a resource. Ordered so that plans serialise
/// deterministically.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Kind of infrastructure resource the core knows how to reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Virtual machine (Proxmox guest or Linode instance)
    Vm,
    /// Load balancer appliance
    LoadBalancer,
    /// Port configuration attached to a load balancer
    LbConfig,
    /// Backend node registered under a load balancer config
    LbNode,
}

impl ResourceKind {
    /// Fields that cannot be changed in place. Drift on one of these
    /// forces a destructive replace instead of an update.
    pub fn immutable_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Vm => &["image", "template_vmid", "vmid"],
            ResourceKind::LoadBalancer => &["region"],
            ResourceKind::LbConfig => &["port"],
            ResourceKind::LbNode => &[],
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Vm => write!(f, "vm"),
            ResourceKind::LoadBalancer => write!(f, "load-balancer"),
            ResourceKind::LbConfig => write!(f, "lb-config"),
            ResourceKind::LbNode => write!(f, "lb-node"),
        }
    }
}

/// Identity of a resource: kind plus name. Names are unique within a
/// kind, so the pair is unique across the whole state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Key used when the resource is stored in a string-keyed map
    /// (state file, JSON).
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Declarative description of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,

    /// Unique within `kind`.
    pub name: String,

    /// Name of the registered provider that owns this resource
    /// (e.g. "proxmox", "linode").
    pub provider: String,

    /// Desired attributes. String values may contain
    /// `${resource-name.attribute}` placeholders resolved at apply time
    /// from already-applied resources.
    pub attributes: Attributes,

    /// Names of resources that must be applied before this one.
    pub depends_on: BTreeSet<String>,

    /// Export key -> attribute name published after a successful apply.
    pub exports: BTreeMap<String, String>,
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind, name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            provider: provider.into(),
            attributes: Attributes::new(),
            depends_on: BTreeSet::new(),
            exports: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.name.clone())
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.insert(name.into());
        self
    }

    pub fn export(mut self, key: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.exports.insert(key.into(), attribute.into());
        self
    }
}

/// Cluster-wide settings shared by every resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Project/cluster name.
    pub name: String,

    /// Proxmox node that hosts the VMs.
    pub node_name: String,

    /// VM id of the cloud-init template the VMs are cloned from.
    pub template_vmid: u32,

    /// Datastore for cloned disks.
    pub datastore: String,

    /// Network bridge the VM NICs attach to.
    pub bridge: String,

    /// Default gateway handed to cloud-init.
    pub gateway: String,

    /// DNS server handed to cloud-init.
    pub dns_server: String,

    /// SSH public key installed on every node.
    pub ssh_public_key: String,

    /// Cloud region for the edge resources.
    pub region: String,
}

/// Validated, immutable desired state. Construction is the validation
/// step: the only way to obtain one is [`DesiredState::builder`].
#[derive(Debug, Clone, Serialize)]
pub struct DesiredState {
    settings: GlobalSettings,
    resources: Vec<ResourceSpec>,
}

impl DesiredState {
    pub fn builder(settings: GlobalSettings) -> DesiredStateBuilder {
        DesiredStateBuilder {
            settings,
            resources: Vec::new(),
        }
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    /// Resources in declaration order.
    pub fn resources(&self) -> &[ResourceSpec] {
        &self.resources
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| &r.key() == key)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.get(key).is_some()
    }

    /// An empty desired state with the same settings. Planning against
    /// it yields a full teardown.
    pub fn emptied(&self) -> DesiredState {
        DesiredState {
            settings: self.settings.clone(),
            resources: Vec::new(),
        }
    }
}

/// Accumulates resource specs and validates them into a [`DesiredState`].
pub struct DesiredStateBuilder {
    settings: GlobalSettings,
    resources: Vec<ResourceSpec>,
}

impl DesiredStateBuilder {
    pub fn resource(mut self, spec: ResourceSpec) -> Self {
        self.resources.push(spec);
        self
    }

    /// Validate and freeze. Fails on duplicate (kind, name) pairs and on
    /// dependency references that resolve to zero or multiple resources.
    pub fn build(self) -> Result<DesiredState, ConfigError> {
        let mut seen: BTreeSet<ResourceKey> = BTreeSet::new();
        let mut name_count: BTreeMap<&str, usize> = BTreeMap::new();

        for spec in &self.resources {
            if !seen.insert(spec.key()) {
                return Err(ConfigError::DuplicateResource(spec.key()));
            }
            *name_count.entry(spec.name.as_str()).or_insert(0) += 1;
        }

        for spec in &self.resources {
            for dep in &spec.depends_on {
                match name_count.get(dep.as_str()) {
                    None => {
                        return Err(ConfigError::UnknownDependency {
                            resource: spec.key(),
                            dependency: dep.clone(),
                        });
                    }
                    Some(n) if *n > 1 => {
                        return Err(ConfigError::AmbiguousDependency {
                            resource: spec.key(),
                            dependency: dep.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        tracing::debug!(
            resources = self.resources.len(),
            "validated desired state"
        );

        Ok(DesiredState {
            settings: self.settings,
            resources: self.resources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str) -> ResourceSpec {
        ResourceSpec::new(ResourceKind::Vm, name, "proxmox")
    }

    #[test]
    fn build_accepts_unique_resources() {
        let state = DesiredState::builder(GlobalSettings::default())
            .resource(vm("a"))
            .resource(vm("b").depends_on("a"))
            .build()
            .unwrap();
        assert_eq!(state.resources().len(), 2);
        assert!(state.contains(&ResourceKey::new(ResourceKind::Vm, "a")));
    }

    #[test]
    fn build_rejects_duplicate_names_within_kind() {
        let err = DesiredState::builder(GlobalSettings::default())
            .resource(vm("a"))
            .resource(vm("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateResource(_)));
    }

    #[test]
    fn same_name_across_kinds_is_allowed() {
        let state = DesiredState::builder(GlobalSettings::default())
            .resource(vm("edge"))
            .resource(ResourceSpec::new(ResourceKind::LoadBalancer, "edge", "linode"))
            .build();
        assert!(state.is_ok());
    }

    #[test]
    fn build_rejects_unknown_dependency() {
        let err = DesiredState::builder(GlobalSettings::default())
            .resource(vm("a").depends_on("nope"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDependency { .. }));
    }

    #[test]
    fn build_rejects_ambiguous_dependency() {
        let err = DesiredState::builder(GlobalSettings::default())
            .resource(vm("edge"))
            .resource(ResourceSpec::new(ResourceKind::LoadBalancer, "edge", "linode"))
            .resource(vm("b").depends_on("edge"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousDependency { .. }));
    }
}
