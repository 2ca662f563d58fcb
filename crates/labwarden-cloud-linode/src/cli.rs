//! linode-cli wrapper
//!
//! Wraps `linode-cli` with `--json` output. Instances and
//! NodeBalancers are tagged `labwarden:{resource-name}` at creation so
//! later runs can find them by identity rather than by label.

use crate::error::{LinodeError, Result};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Tag prefix marking resources managed by labwarden.
pub const TAG_PREFIX: &str = "labwarden:";

pub fn identity_tag(name: &str) -> String {
    format!("{TAG_PREFIX}{name}")
}

/// linode-cli wrapper.
#[derive(Default)]
pub struct LinodeCli;

impl LinodeCli {
    pub fn new() -> Self {
        Self
    }

    /// Check that linode-cli is installed.
    pub async fn check(&self) -> Result<()> {
        let which = Command::new("which").arg("linode-cli").output().await?;
        if !which.status.success() {
            return Err(LinodeError::CliNotFound);
        }
        Ok(())
    }

    /// Run a linode-cli command and return stdout.
    async fn run_command(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("linode-cli");
        cmd.args(args);
        cmd.arg("--json");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: linode-cli {}", args.join(" "));

        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LinodeError::CommandFailed(stderr.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn decode_list<T: serde::de::DeserializeOwned>(output: &str) -> Result<Vec<T>> {
        if output.trim().is_empty() || output.trim() == "[]" {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(output)?)
    }

    // ── Instances ────────────────────────────────────────────────────

    pub async fn list_instances(&self) -> Result<Vec<InstanceInfo>> {
        let output = self.run_command(&["linodes", "list"]).await?;
        Self::decode_list(&output)
    }

    pub async fn find_instance(&self, name: &str) -> Result<Option<InstanceInfo>> {
        let tag = identity_tag(name);
        let instances = self.list_instances().await?;
        Ok(instances.into_iter().find(|i| i.tags.contains(&tag)))
    }

    pub async fn create_instance(&self, config: &CreateInstanceConfig) -> Result<InstanceInfo> {
        let mut args = vec![
            "linodes",
            "create",
            "--label",
            config.label.as_str(),
            "--image",
            config.image.as_str(),
            "--region",
            config.region.as_str(),
            "--type",
            config.instance_type.as_str(),
            "--root_pass",
            config.root_pass.as_str(),
            "--private_ip",
            "true",
            "--booted",
            "true",
        ];
        for key in &config.authorized_keys {
            args.push("--authorized_keys");
            args.push(key.as_str());
        }
        for tag in &config.tags {
            args.push("--tags");
            args.push(tag.as_str());
        }

        let output = self.run_command(&args).await?;
        let mut created: Vec<InstanceInfo> = Self::decode_list(&output)?;
        created
            .pop()
            .ok_or_else(|| LinodeError::CommandFailed("empty create response".to_string()))
    }

    pub async fn delete_instance(&self, id: u64) -> Result<()> {
        let id = id.to_string();
        self.run_command(&["linodes", "delete", &id]).await?;
        Ok(())
    }

    // ── NodeBalancers ────────────────────────────────────────────────

    pub async fn list_nodebalancers(&self) -> Result<Vec<NodeBalancerInfo>> {
        let output = self.run_command(&["nodebalancers", "list"]).await?;
        Self::decode_list(&output)
    }

    pub async fn find_nodebalancer(&self, name: &str) -> Result<Option<NodeBalancerInfo>> {
        let tag = identity_tag(name);
        let balancers = self.list_nodebalancers().await?;
        Ok(balancers.into_iter().find(|b| b.tags.contains(&tag)))
    }

    pub async fn create_nodebalancer(
        &self,
        config: &CreateNodeBalancerConfig,
    ) -> Result<NodeBalancerInfo> {
        let throttle = config.client_conn_throttle.to_string();
        let mut args = vec![
            "nodebalancers",
            "create",
            "--label",
            config.label.as_str(),
            "--region",
            config.region.as_str(),
            "--client_conn_throttle",
            throttle.as_str(),
        ];
        for tag in &config.tags {
            args.push("--tags");
            args.push(tag.as_str());
        }

        let output = self.run_command(&args).await?;
        let mut created: Vec<NodeBalancerInfo> = Self::decode_list(&output)?;
        created
            .pop()
            .ok_or_else(|| LinodeError::CommandFailed("empty create response".to_string()))
    }

    pub async fn update_nodebalancer(&self, id: u64, options: &[(&str, String)]) -> Result<()> {
        let id = id.to_string();
        let mut args: Vec<&str> = vec!["nodebalancers", "update", &id];

        let mut flags: Vec<(String, &str)> = Vec::new();
        for (key, value) in options {
            flags.push((format!("--{key}"), value.as_str()));
        }
        for (flag, value) in &flags {
            args.push(flag);
            args.push(value);
        }

        self.run_command(&args).await?;
        Ok(())
    }

    pub async fn delete_nodebalancer(&self, id: u64) -> Result<()> {
        let id = id.to_string();
        self.run_command(&["nodebalancers", "delete", &id]).await?;
        Ok(())
    }

    // ── NodeBalancer configs ─────────────────────────────────────────

    pub async fn list_configs(&self, nodebalancer_id: u64) -> Result<Vec<ConfigInfo>> {
        let id = nodebalancer_id.to_string();
        let output = self
            .run_command(&["nodebalancers", "configs-list", &id])
            .await?;
        Self::decode_list(&output)
    }

    pub async fn create_config(
        &self,
        nodebalancer_id: u64,
        config: &CreateConfigConfig,
    ) -> Result<ConfigInfo> {
        let id = nodebalancer_id.to_string();
        let port = config.port.to_string();
        let interval = config.check_interval.to_string();
        let timeout = config.check_timeout.to_string();
        let attempts = config.check_attempts.to_string();

        let output = self
            .run_command(&[
                "nodebalancers",
                "config-create",
                &id,
                "--port",
                &port,
                "--protocol",
                config.protocol.as_str(),
                "--algorithm",
                config.algorithm.as_str(),
                "--check",
                config.check.as_str(),
                "--check_interval",
                &interval,
                "--check_timeout",
                &timeout,
                "--check_attempts",
                &attempts,
                "--stickiness",
                config.stickiness.as_str(),
            ])
            .await?;
        let mut created: Vec<ConfigInfo> = Self::decode_list(&output)?;
        created
            .pop()
            .ok_or_else(|| LinodeError::CommandFailed("empty create response".to_string()))
    }

    pub async fn update_config(
        &self,
        nodebalancer_id: u64,
        config_id: u64,
        options: &[(&str, String)],
    ) -> Result<()> {
        let nb = nodebalancer_id.to_string();
        let cfg = config_id.to_string();
        let mut args: Vec<&str> = vec!["nodebalancers", "config-update", &nb, &cfg];

        let mut flags: Vec<(String, &str)> = Vec::new();
        for (key, value) in options {
            flags.push((format!("--{key}"), value.as_str()));
        }
        for (flag, value) in &flags {
            args.push(flag);
            args.push(value);
        }

        self.run_command(&args).await?;
        Ok(())
    }

    pub async fn delete_config(&self, nodebalancer_id: u64, config_id: u64) -> Result<()> {
        let nb = nodebalancer_id.to_string();
        let cfg = config_id.to_string();
        self.run_command(&["nodebalancers", "config-delete", &nb, &cfg])
            .await?;
        Ok(())
    }

    // ── Backend nodes ────────────────────────────────────────────────

    pub async fn list_nodes(&self, nodebalancer_id: u64, config_id: u64) -> Result<Vec<NodeInfo>> {
        let nb = nodebalancer_id.to_string();
        let cfg = config_id.to_string();
        let output = self
            .run_command(&["nodebalancers", "nodes-list", &nb, &cfg])
            .await?;
        Self::decode_list(&output)
    }

    pub async fn create_node(
        &self,
        nodebalancer_id: u64,
        config_id: u64,
        config: &CreateNodeConfig,
    ) -> Result<NodeInfo> {
        let nb = nodebalancer_id.to_string();
        let cfg = config_id.to_string();
        let weight = config.weight.to_string();

        let output = self
            .run_command(&[
                "nodebalancers",
                "node-create",
                &nb,
                &cfg,
                "--address",
                config.address.as_str(),
                "--label",
                config.label.as_str(),
                "--weight",
                &weight,
            ])
            .await?;
        let mut created: Vec<NodeInfo> = Self::decode_list(&output)?;
        created
            .pop()
            .ok_or_else(|| LinodeError::CommandFailed("empty create response".to_string()))
    }

    pub async fn update_node(
        &self,
        nodebalancer_id: u64,
        config_id: u64,
        node_id: u64,
        options: &[(&str, String)],
    ) -> Result<()> {
        let nb = nodebalancer_id.to_string();
        let cfg = config_id.to_string();
        let node = node_id.to_string();
        let mut args: Vec<&str> = vec!["nodebalancers", "node-update", &nb, &cfg, &node];

        let mut flags: Vec<(String, &str)> = Vec::new();
        for (key, value) in options {
            flags.push((format!("--{key}"), value.as_str()));
        }
        for (flag, value) in &flags {
            args.push(flag);
            args.push(value);
        }

        self.run_command(&args).await?;
        Ok(())
    }

    pub async fn delete_node(
        &self,
        nodebalancer_id: u64,
        config_id: u64,
        node_id: u64,
    ) -> Result<()> {
        let nb = nodebalancer_id.to_string();
        let cfg = config_id.to_string();
        let node = node_id.to_string();
        self.run_command(&["nodebalancers", "node-delete", &nb, &cfg, &node])
            .await?;
        Ok(())
    }
}

/// One row of `linode-cli linodes list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: u64,
    pub label: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl InstanceInfo {
    /// First public address. Linode private addresses live in
    /// 192.168.128.0/17.
    pub fn public_ip(&self) -> Option<&str> {
        self.ipv4
            .iter()
            .find(|ip| !ip.starts_with("192.168."))
            .map(|s| s.as_str())
    }

    pub fn private_ip(&self) -> Option<&str> {
        self.ipv4
            .iter()
            .find(|ip| ip.starts_with("192.168."))
            .map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeBalancerInfo {
    pub id: u64,
    pub label: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ipv4: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub id: u64,
    pub port: u16,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    pub label: String,
    pub address: String,
    #[serde(default)]
    pub weight: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CreateInstanceConfig {
    pub label: String,
    pub image: String,
    pub region: String,
    pub instance_type: String,
    pub root_pass: String,
    pub authorized_keys: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreateNodeBalancerConfig {
    pub label: String,
    pub region: String,
    pub client_conn_throttle: u32,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CreateConfigConfig {
    pub port: u16,
    pub protocol: String,
    pub algorithm: String,
    pub check: String,
    pub check_interval: u32,
    pub check_timeout: u32,
    pub check_attempts: u32,
    pub stickiness: String,
}

#[derive(Debug, Clone)]
pub struct CreateNodeConfig {
    pub address: String,
    pub label: String,
    pub weight: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_ip_classification() {
        let info = InstanceInfo {
            id: 1,
            label: "edge".to_string(),
            status: None,
            ipv4: vec!["203.0.113.10".to_string(), "192.168.140.25".to_string()],
            tags: vec![],
        };
        assert_eq!(info.public_ip(), Some("203.0.113.10"));
        assert_eq!(info.private_ip(), Some("192.168.140.25"));
    }

    #[test]
    fn identity_tag_format() {
        assert_eq!(identity_tag("edge-node"), "labwarden:edge-node");
    }
}
