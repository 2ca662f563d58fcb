//! Linode provider implementation
//!
//! Owns the edge instance and the whole NodeBalancer tree. Instances
//! and NodeBalancers carry a `labwarden:{name}` identity tag; configs
//! and backend nodes are located through their tagged parent (configs
//! by port, nodes by label), since the upstream API gives them no tags.

use crate::cli::{
    identity_tag, ConfigInfo, CreateConfigConfig, CreateInstanceConfig, CreateNodeBalancerConfig,
    CreateNodeConfig, LinodeCli, NodeInfo, TAG_PREFIX,
};
use crate::error::{LinodeError, Result};
use async_trait::async_trait;
use labwarden_core::{
    Attributes, CreatedResource, Provider, ProviderError, ResourceKind, ResourceSpec,
};
use serde_json::json;

pub const PROVIDER_NAME: &str = "linode";

/// Network (and edge compute) adapter.
#[derive(Default)]
pub struct LinodeProvider {
    cli: LinodeCli,
}

impl LinodeProvider {
    pub fn new() -> Self {
        Self {
            cli: LinodeCli::new(),
        }
    }

    fn attr_str<'a>(spec: &'a ResourceSpec, key: &'static str) -> Result<&'a str> {
        spec.attributes
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or(LinodeError::MissingAttribute(key))
    }

    fn attr_u32(spec: &ResourceSpec, key: &'static str) -> Result<u32> {
        spec.attributes
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .ok_or(LinodeError::MissingAttribute(key))
    }

    fn attr_strings(spec: &ResourceSpec, key: &str) -> Vec<String> {
        spec.attributes
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Provider ids arrive either as JSON numbers or as resolved
    /// `${resource.id}` strings.
    fn attr_id(spec: &ResourceSpec, key: &'static str) -> Result<u64> {
        let value = spec
            .attributes
            .get(key)
            .ok_or(LinodeError::MissingAttribute(key))?;
        match value {
            serde_json::Value::Number(n) => n.as_u64().ok_or(LinodeError::MissingAttribute(key)),
            serde_json::Value::String(s) => s
                .parse::<u64>()
                .map_err(|_| LinodeError::MissingAttribute(key)),
            _ => Err(LinodeError::MissingAttribute(key)),
        }
    }

    /// The port an lb-config is responsible for, derived from its name
    /// suffix. Ports are unique across the fleet's single balancer.
    fn port_from_name(name: &str) -> Result<u16> {
        if name.ends_with("https") {
            Ok(443)
        } else if name.ends_with("http") {
            Ok(80)
        } else {
            Err(LinodeError::UnknownPort(name.to_string()))
        }
    }

    /// Find a config by name across all labwarden-tagged balancers.
    async fn locate_config(&self, name: &str) -> Result<Option<(u64, ConfigInfo)>> {
        let port = Self::port_from_name(name)?;
        for balancer in self.cli.list_nodebalancers().await? {
            if !balancer.tags.iter().any(|t| t.starts_with(TAG_PREFIX)) {
                continue;
            }
            if let Some(config) = self
                .cli
                .list_configs(balancer.id)
                .await?
                .into_iter()
                .find(|c| c.port == port)
            {
                return Ok(Some((balancer.id, config)));
            }
        }
        Ok(None)
    }

    /// Find a backend node by label across all labwarden-tagged
    /// balancers.
    async fn locate_node(&self, name: &str) -> Result<Option<(u64, u64, NodeInfo)>> {
        for balancer in self.cli.list_nodebalancers().await? {
            if !balancer.tags.iter().any(|t| t.starts_with(TAG_PREFIX)) {
                continue;
            }
            for config in self.cli.list_configs(balancer.id).await? {
                if let Some(node) = self
                    .cli
                    .list_nodes(balancer.id, config.id)
                    .await?
                    .into_iter()
                    .find(|n| n.label == name)
                {
                    return Ok(Some((balancer.id, config.id, node)));
                }
            }
        }
        Ok(None)
    }

    async fn create_instance(&self, spec: &ResourceSpec) -> Result<CreatedResource> {
        if let Some(existing) = self.cli.find_instance(&spec.name).await? {
            tracing::info!(instance = %spec.name, id = existing.id, "instance already exists");
            return Ok(instance_result(&existing));
        }

        let mut tags = Self::attr_strings(spec, "tags");
        tags.push(identity_tag(&spec.name));

        let created = self
            .cli
            .create_instance(&CreateInstanceConfig {
                label: Self::attr_str(spec, "label")?.to_string(),
                image: Self::attr_str(spec, "image")?.to_string(),
                region: Self::attr_str(spec, "region")?.to_string(),
                instance_type: Self::attr_str(spec, "type")?.to_string(),
                root_pass: Self::attr_str(spec, "root_password")?.to_string(),
                authorized_keys: Self::attr_strings(spec, "authorized_keys"),
                tags,
            })
            .await?;

        tracing::info!(instance = %spec.name, id = created.id, "created instance");
        Ok(instance_result(&created))
    }

    async fn create_nodebalancer(&self, spec: &ResourceSpec) -> Result<CreatedResource> {
        if let Some(existing) = self.cli.find_nodebalancer(&spec.name).await? {
            tracing::info!(nodebalancer = %spec.name, id = existing.id, "nodebalancer already exists");
            return Ok(nodebalancer_result(existing.id, &existing.hostname, &existing.ipv4));
        }

        let mut tags = Self::attr_strings(spec, "tags");
        tags.push(identity_tag(&spec.name));

        let created = self
            .cli
            .create_nodebalancer(&CreateNodeBalancerConfig {
                label: Self::attr_str(spec, "label")?.to_string(),
                region: Self::attr_str(spec, "region")?.to_string(),
                client_conn_throttle: Self::attr_u32(spec, "client_conn_throttle")?,
                tags,
            })
            .await?;

        tracing::info!(nodebalancer = %spec.name, id = created.id, "created nodebalancer");
        Ok(nodebalancer_result(created.id, &created.hostname, &created.ipv4))
    }

    async fn create_config(&self, spec: &ResourceSpec) -> Result<CreatedResource> {
        let nodebalancer_id = Self::attr_id(spec, "nodebalancer")?;
        let port = Self::attr_u32(spec, "port")? as u16;

        if let Some(existing) = self
            .cli
            .list_configs(nodebalancer_id)
            .await?
            .into_iter()
            .find(|c| c.port == port)
        {
            tracing::info!(config = %spec.name, id = existing.id, "config already exists");
            return Ok(CreatedResource::new(existing.id.to_string()));
        }

        let created = self
            .cli
            .create_config(
                nodebalancer_id,
                &CreateConfigConfig {
                    port,
                    protocol: Self::attr_str(spec, "protocol")?.to_string(),
                    algorithm: Self::attr_str(spec, "algorithm")?.to_string(),
                    check: Self::attr_str(spec, "check")?.to_string(),
                    check_interval: Self::attr_u32(spec, "check_interval")?,
                    check_timeout: Self::attr_u32(spec, "check_timeout")?,
                    check_attempts: Self::attr_u32(spec, "check_attempts")?,
                    stickiness: Self::attr_str(spec, "stickiness")?.to_string(),
                },
            )
            .await?;

        tracing::info!(config = %spec.name, id = created.id, "created nodebalancer config");
        Ok(CreatedResource::new(created.id.to_string()))
    }

    async fn create_node(&self, spec: &ResourceSpec) -> Result<CreatedResource> {
        let nodebalancer_id = Self::attr_id(spec, "nodebalancer")?;
        let config_id = Self::attr_id(spec, "config")?;
        let label = Self::attr_str(spec, "label")?;

        if let Some(existing) = self
            .cli
            .list_nodes(nodebalancer_id, config_id)
            .await?
            .into_iter()
            .find(|n| n.label == label)
        {
            tracing::info!(node = %spec.name, id = existing.id, "backend node already exists");
            return Ok(CreatedResource::new(existing.id.to_string()));
        }

        let created = self
            .cli
            .create_node(
                nodebalancer_id,
                config_id,
                &CreateNodeConfig {
                    address: Self::attr_str(spec, "address")?.to_string(),
                    label: label.to_string(),
                    weight: Self::attr_u32(spec, "weight")?,
                },
            )
            .await?;

        tracing::info!(node = %spec.name, id = created.id, "created backend node");
        Ok(CreatedResource::new(created.id.to_string()))
    }
}

fn instance_result(info: &crate::cli::InstanceInfo) -> CreatedResource {
    let mut result = CreatedResource::new(info.id.to_string());
    if let Some(ip) = info.public_ip() {
        result.attributes.insert("ip_address".to_string(), json!(ip));
    }
    if let Some(ip) = info.private_ip() {
        result.attributes.insert("private_ip".to_string(), json!(ip));
    }
    result
}

fn nodebalancer_result(
    id: u64,
    hostname: &Option<String>,
    ipv4: &Option<String>,
) -> CreatedResource {
    let mut result = CreatedResource::new(id.to_string());
    if let Some(hostname) = hostname {
        result.attributes.insert("hostname".to_string(), json!(hostname));
    }
    if let Some(ipv4) = ipv4 {
        result.attributes.insert("ipv4".to_string(), json!(ipv4));
    }
    result
}

#[async_trait]
impl Provider for LinodeProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn create(&self, spec: &ResourceSpec) -> std::result::Result<CreatedResource, ProviderError> {
        let created = match spec.kind {
            ResourceKind::Vm => self.create_instance(spec).await?,
            ResourceKind::LoadBalancer => self.create_nodebalancer(spec).await?,
            ResourceKind::LbConfig => self.create_config(spec).await?,
            ResourceKind::LbNode => self.create_node(spec).await?,
        };
        Ok(created)
    }

    async fn read(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> std::result::Result<Option<Attributes>, ProviderError> {
        let attrs = match kind {
            ResourceKind::Vm => self
                .cli
                .find_instance(name)
                .await
                .map_err(ProviderError::from)?
                .map(|i| {
                    let mut attrs = Attributes::new();
                    attrs.insert("label".to_string(), json!(i.label));
                    if let Some(status) = &i.status {
                        attrs.insert("status".to_string(), json!(status));
                    }
                    if let Some(ip) = i.public_ip() {
                        attrs.insert("ip_address".to_string(), json!(ip));
                    }
                    if let Some(ip) = i.private_ip() {
                        attrs.insert("private_ip".to_string(), json!(ip));
                    }
                    attrs
                }),
            ResourceKind::LoadBalancer => self
                .cli
                .find_nodebalancer(name)
                .await
                .map_err(ProviderError::from)?
                .map(|b| {
                    let mut attrs = Attributes::new();
                    attrs.insert("label".to_string(), json!(b.label));
                    if let Some(hostname) = &b.hostname {
                        attrs.insert("hostname".to_string(), json!(hostname));
                    }
                    if let Some(ipv4) = &b.ipv4 {
                        attrs.insert("ipv4".to_string(), json!(ipv4));
                    }
                    attrs
                }),
            ResourceKind::LbConfig => self
                .locate_config(name)
                .await
                .map_err(ProviderError::from)?
                .map(|(_, c)| {
                    let mut attrs = Attributes::new();
                    attrs.insert("port".to_string(), json!(c.port));
                    if let Some(protocol) = &c.protocol {
                        attrs.insert("protocol".to_string(), json!(protocol));
                    }
                    attrs
                }),
            ResourceKind::LbNode => self
                .locate_node(name)
                .await
                .map_err(ProviderError::from)?
                .map(|(_, _, n)| {
                    let mut attrs = Attributes::new();
                    attrs.insert("address".to_string(), json!(n.address));
                    if let Some(weight) = n.weight {
                        attrs.insert("weight".to_string(), json!(weight));
                    }
                    attrs
                }),
        };
        Ok(attrs)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        changes: &Attributes,
    ) -> std::result::Result<(), ProviderError> {
        match kind {
            ResourceKind::Vm => {
                // Nothing on an edge instance is updated in place; drift
                // on image/region/type shows up as a replace instead.
                for field in changes.keys() {
                    tracing::warn!(instance = name, field = %field, "ignoring non-updatable field");
                }
                Ok(())
            }
            ResourceKind::LoadBalancer => {
                let balancer = self
                    .cli
                    .find_nodebalancer(name)
                    .await
                    .map_err(ProviderError::from)?
                    .ok_or_else(|| ProviderError::from(LinodeError::NotFound(name.to_string())))?;

                let mut options: Vec<(&str, String)> = Vec::new();
                for (field, value) in changes {
                    match field.as_str() {
                        "label" => {
                            if let Some(v) = value.as_str() {
                                options.push(("label", v.to_string()));
                            }
                        }
                        "client_conn_throttle" => {
                            if let Some(v) = value.as_u64() {
                                options.push(("client_conn_throttle", v.to_string()));
                            }
                        }
                        other => {
                            tracing::warn!(nodebalancer = name, field = other, "ignoring non-updatable field");
                        }
                    }
                }
                if !options.is_empty() {
                    self.cli
                        .update_nodebalancer(balancer.id, &options)
                        .await
                        .map_err(ProviderError::from)?;
                }
                Ok(())
            }
            ResourceKind::LbConfig => {
                let (nodebalancer_id, config) = self
                    .locate_config(name)
                    .await
                    .map_err(ProviderError::from)?
                    .ok_or_else(|| ProviderError::from(LinodeError::NotFound(name.to_string())))?;

                let mut options: Vec<(&str, String)> = Vec::new();
                for (field, value) in changes {
                    match field.as_str() {
                        "check_interval" | "check_timeout" | "check_attempts" => {
                            if let Some(v) = value.as_u64() {
                                options.push((
                                    match field.as_str() {
                                        "check_interval" => "check_interval",
                                        "check_timeout" => "check_timeout",
                                        _ => "check_attempts",
                                    },
                                    v.to_string(),
                                ));
                            }
                        }
                        "protocol" | "algorithm" | "check" | "stickiness" => {
                            if let Some(v) = value.as_str() {
                                options.push((
                                    match field.as_str() {
                                        "protocol" => "protocol",
                                        "algorithm" => "algorithm",
                                        "check" => "check",
                                        _ => "stickiness",
                                    },
                                    v.to_string(),
                                ));
                            }
                        }
                        other => {
                            tracing::warn!(config = name, field = other, "ignoring non-updatable field");
                        }
                    }
                }
                if !options.is_empty() {
                    self.cli
                        .update_config(nodebalancer_id, config.id, &options)
                        .await
                        .map_err(ProviderError::from)?;
                }
                Ok(())
            }
            ResourceKind::LbNode => {
                let (nodebalancer_id, config_id, node) = self
                    .locate_node(name)
                    .await
                    .map_err(ProviderError::from)?
                    .ok_or_else(|| ProviderError::from(LinodeError::NotFound(name.to_string())))?;

                let mut options: Vec<(&str, String)> = Vec::new();
                for (field, value) in changes {
                    match field.as_str() {
                        "address" => {
                            if let Some(v) = value.as_str() {
                                options.push(("address", v.to_string()));
                            }
                        }
                        "weight" => {
                            if let Some(v) = value.as_u64() {
                                options.push(("weight", v.to_string()));
                            }
                        }
                        other => {
                            tracing::warn!(node = name, field = other, "ignoring non-updatable field");
                        }
                    }
                }
                if !options.is_empty() {
                    self.cli
                        .update_node(nodebalancer_id, config_id, node.id, &options)
                        .await
                        .map_err(ProviderError::from)?;
                }
                Ok(())
            }
        }
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> std::result::Result<(), ProviderError> {
        match kind {
            ResourceKind::Vm => {
                if let Some(instance) = self
                    .cli
                    .find_instance(name)
                    .await
                    .map_err(ProviderError::from)?
                {
                    self.cli
                        .delete_instance(instance.id)
                        .await
                        .map_err(ProviderError::from)?;
                    tracing::info!(instance = name, id = instance.id, "deleted instance");
                } else {
                    tracing::debug!(instance = name, "already gone");
                }
                Ok(())
            }
            ResourceKind::LoadBalancer => {
                if let Some(balancer) = self
                    .cli
                    .find_nodebalancer(name)
                    .await
                    .map_err(ProviderError::from)?
                {
                    self.cli
                        .delete_nodebalancer(balancer.id)
                        .await
                        .map_err(ProviderError::from)?;
                    tracing::info!(nodebalancer = name, id = balancer.id, "deleted nodebalancer");
                } else {
                    tracing::debug!(nodebalancer = name, "already gone");
                }
                Ok(())
            }
            ResourceKind::LbConfig => {
                if let Some((nodebalancer_id, config)) = self
                    .locate_config(name)
                    .await
                    .map_err(ProviderError::from)?
                {
                    self.cli
                        .delete_config(nodebalancer_id, config.id)
                        .await
                        .map_err(ProviderError::from)?;
                    tracing::info!(config = name, id = config.id, "deleted nodebalancer config");
                } else {
                    tracing::debug!(config = name, "already gone");
                }
                Ok(())
            }
            ResourceKind::LbNode => {
                if let Some((nodebalancer_id, config_id, node)) = self
                    .locate_node(name)
                    .await
                    .map_err(ProviderError::from)?
                {
                    self.cli
                        .delete_node(nodebalancer_id, config_id, node.id)
                        .await
                        .map_err(ProviderError::from)?;
                    tracing::info!(node = name, id = node.id, "deleted backend node");
                } else {
                    tracing::debug!(node = name, "already gone");
                }
                Ok(())
            }
        }
    }
}
