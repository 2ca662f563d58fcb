//! pvesh CLI wrapper
//!
//! Wraps the `pvesh` command for Proxmox VE API access. Every call goes
//! through the JSON output format so responses can be decoded with
//! serde.

use crate::error::{ProxmoxError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;

/// Snippet storage of the `local` datastore. pvesh runs on the PVE node
/// itself, so cloud-init snippets are plain local file writes.
const SNIPPETS_DIR: &str = "/var/lib/vz/snippets";

/// pvesh CLI wrapper, scoped to one Proxmox node.
pub struct Pvesh {
    node: String,
    snippets_dir: PathBuf,
}

impl Pvesh {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            snippets_dir: PathBuf::from(SNIPPETS_DIR),
        }
    }

    pub fn with_snippets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snippets_dir = dir.into();
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Write a cloud-init snippet and return the volume id to hand to
    /// `--cicustom`.
    pub async fn write_snippet(&self, filename: &str, content: &str) -> Result<String> {
        fs::create_dir_all(&self.snippets_dir).await?;
        fs::write(self.snippets_dir.join(filename), content).await?;
        tracing::debug!(snippet = filename, "wrote cloud-init snippet");
        Ok(format!("local:snippets/{filename}"))
    }

    pub async fn remove_snippet(&self, filename: &str) -> Result<()> {
        let path = self.snippets_dir.join(filename);
        if path.exists() {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    /// Check that pvesh is available.
    pub async fn check(&self) -> Result<()> {
        let which = Command::new("which").arg("pvesh").output().await?;
        if !which.status.success() {
            return Err(ProxmoxError::PveshNotFound);
        }
        Ok(())
    }

    /// Run a pvesh command and return stdout.
    async fn run_command(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("pvesh");
        cmd.args(args);
        cmd.args(["--output-format", "json"]);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("Running: pvesh {}", args.join(" "));

        let output = cmd.output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProxmoxError::CommandFailed(stderr.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// List all VMs on the node.
    pub async fn list_vms(&self) -> Result<Vec<VmInfo>> {
        let path = format!("/nodes/{}/qemu", self.node);
        let output = self.run_command(&["get", &path]).await?;

        if output.trim().is_empty() || output.trim() == "[]" {
            return Ok(Vec::new());
        }

        let vms: Vec<VmInfo> = serde_json::from_str(&output)?;
        Ok(vms)
    }

    /// Find a VM by name.
    pub async fn find_vm(&self, name: &str) -> Result<Option<VmInfo>> {
        let vms = self.list_vms().await?;
        Ok(vms.into_iter().find(|v| v.name.as_deref() == Some(name)))
    }

    /// Clone a VM from a template.
    pub async fn clone_vm(&self, template_vmid: u32, config: &CloneConfig) -> Result<()> {
        let path = format!("/nodes/{}/qemu/{}/clone", self.node, template_vmid);
        let newid = config.vmid.to_string();

        self.run_command(&[
            "create",
            &path,
            "--newid",
            &newid,
            "--name",
            &config.name,
            "--full",
            "1",
            "--storage",
            &config.datastore,
        ])
        .await?;
        Ok(())
    }

    /// Apply config options to a VM (`pvesh set .../config`).
    pub async fn set_config(&self, vmid: u32, options: &[(&str, String)]) -> Result<()> {
        let path = format!("/nodes/{}/qemu/{}/config", self.node, vmid);
        let mut args: Vec<&str> = vec!["set", &path];

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

    /// Grow a disk to the given size.
    pub async fn resize_disk(&self, vmid: u32, disk: &str, size_gb: u32) -> Result<()> {
        let path = format!("/nodes/{}/qemu/{}/resize", self.node, vmid);
        let size = format!("{size_gb}G");
        self.run_command(&["set", &path, "--disk", disk, "--size", &size])
            .await?;
        Ok(())
    }

    pub async fn start_vm(&self, vmid: u32) -> Result<()> {
        let path = format!("/nodes/{}/qemu/{}/status/start", self.node, vmid);
        self.run_command(&["create", &path]).await?;
        Ok(())
    }

    pub async fn stop_vm(&self, vmid: u32) -> Result<()> {
        let path = format!("/nodes/{}/qemu/{}/status/stop", self.node, vmid);
        self.run_command(&["create", &path]).await?;
        Ok(())
    }

    /// Delete a VM and its disks.
    pub async fn delete_vm(&self, vmid: u32) -> Result<()> {
        let path = format!("/nodes/{}/qemu/{}", self.node, vmid);
        self.run_command(&["delete", &path, "--purge", "1", "--destroy-unreferenced-disks", "1"])
            .await?;
        Ok(())
    }
}

/// One row of `pvesh get /nodes/{node}/qemu`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub vmid: u32,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub tags: Option<String>,
}

impl VmInfo {
    pub fn is_running(&self) -> bool {
        self.status.as_deref() == Some("running")
    }
}

/// Parameters for cloning the cloud-init template.
#[derive(Debug, Clone)]
pub struct CloneConfig {
    pub vmid: u32,
    pub name: String,
    pub datastore: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snippet_write_returns_volume_id() {
        let dir = tempfile::tempdir().unwrap();
        let pvesh = Pvesh::new("pve").with_snippets_dir(dir.path());

        let volume = pvesh
            .write_snippet("k3s-a-user-data.yaml", "#cloud-config\n")
            .await
            .unwrap();
        assert_eq!(volume, "local:snippets/k3s-a-user-data.yaml");

        let written = std::fs::read_to_string(dir.path().join("k3s-a-user-data.yaml")).unwrap();
        assert!(written.starts_with("#cloud-config"));
    }

    #[tokio::test]
    async fn snippet_removal_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pvesh = Pvesh::new("pve").with_snippets_dir(dir.path());

        pvesh
            .write_snippet("k3s-a-user-data.yaml", "#cloud-config\n")
            .await
            .unwrap();
        pvesh.remove_snippet("k3s-a-user-data.yaml").await.unwrap();
        assert!(!dir.path().join("k3s-a-user-data.yaml").exists());

        // Removing again is fine.
        pvesh.remove_snippet("k3s-a-user-data.yaml").await.unwrap();
    }
}
