//! Proxmox VE provider implementation

use crate::cloudinit::render_user_data;
use crate::error::{ProxmoxError, Result};
use crate::pvesh::{CloneConfig, Pvesh};
use async_trait::async_trait;
use labwarden_core::{
    Attributes, CreatedResource, Provider, ProviderError, ResourceKind, ResourceSpec,
};

pub const PROVIDER_NAME: &str = "proxmox";

fn snippet_name(vm_name: &str) -> String {
    format!("{vm_name}-user-data.yaml")
}

/// Compute adapter cloning K3s VMs from a cloud-init template.
pub struct ProxmoxProvider {
    pvesh: Pvesh,
}

impl ProxmoxProvider {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            pvesh: Pvesh::new(node),
        }
    }

    fn attr_str<'a>(spec: &'a ResourceSpec, key: &'static str) -> Result<&'a str> {
        spec.attributes
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or(ProxmoxError::MissingAttribute(key))
    }

    fn attr_u32(spec: &ResourceSpec, key: &'static str) -> Result<u32> {
        spec.attributes
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .ok_or(ProxmoxError::MissingAttribute(key))
    }

    async fn create_vm(&self, spec: &ResourceSpec) -> Result<CreatedResource> {
        let name = spec.name.as_str();

        // Idempotent create: a VM with this name already on the node is
        // the resource, return its identifiers.
        if let Some(existing) = self.pvesh.find_vm(name).await? {
            tracing::info!(vm = name, vmid = existing.vmid, "VM already exists");
            let mut created = CreatedResource::new(existing.vmid.to_string());
            if let Some(ip) = spec.attributes.get("ip") {
                created.attributes.insert("ip".to_string(), ip.clone());
            }
            return Ok(created);
        }

        let vmid = Self::attr_u32(spec, "vmid")?;
        let template_vmid = Self::attr_u32(spec, "template_vmid")?;
        let datastore = Self::attr_str(spec, "datastore")?;
        let ip = Self::attr_str(spec, "ip")?;
        let gateway = Self::attr_str(spec, "gateway")?;
        let dns = Self::attr_str(spec, "dns")?;
        let role = Self::attr_str(spec, "role")?;
        let ssh_key = Self::attr_str(spec, "ssh_public_key")?;

        let user_data = render_user_data(name, role, ssh_key)?;
        let volume = self
            .pvesh
            .write_snippet(&snippet_name(name), &user_data)
            .await?;

        self.pvesh
            .clone_vm(
                template_vmid,
                &CloneConfig {
                    vmid,
                    name: name.to_string(),
                    datastore: datastore.to_string(),
                },
            )
            .await?;

        let mut options: Vec<(&str, String)> = vec![
            ("cores", Self::attr_u32(spec, "cores")?.to_string()),
            ("memory", Self::attr_u32(spec, "memory_mb")?.to_string()),
            ("ipconfig0", format!("ip={ip}/24,gw={gateway}")),
            ("nameserver", dns.to_string()),
            ("searchdomain", "home.lab".to_string()),
            ("ciuser", "admin".to_string()),
            ("sshkeys", ssh_key.to_string()),
            ("agent", "enabled=1,fstrim_cloned_disks=1".to_string()),
            ("cicustom", format!("user={volume}")),
            ("onboot", "1".to_string()),
        ];
        if let Some(tags) = spec.attributes.get("tags").and_then(|v| v.as_array()) {
            let joined: Vec<&str> = tags.iter().filter_map(|t| t.as_str()).collect();
            options.push(("tags", joined.join(";")));
        }
        self.pvesh.set_config(vmid, &options).await?;

        self.pvesh
            .resize_disk(vmid, "scsi0", Self::attr_u32(spec, "disk_gb")?)
            .await?;
        self.pvesh.start_vm(vmid).await?;

        tracing::info!(vm = name, vmid, "created VM");
        Ok(CreatedResource::new(vmid.to_string())
            .with_attribute("ip".to_string(), serde_json::json!(ip)))
    }

    async fn update_vm(&self, name: &str, changes: &Attributes) -> Result<()> {
        let vm = self
            .pvesh
            .find_vm(name)
            .await?
            .ok_or_else(|| ProxmoxError::VmNotFound(name.to_string()))?;

        let mut options: Vec<(&str, String)> = Vec::new();
        for (field, value) in changes {
            match field.as_str() {
                "cores" => {
                    if let Some(v) = value.as_u64() {
                        options.push(("cores", v.to_string()));
                    }
                }
                "memory_mb" => {
                    if let Some(v) = value.as_u64() {
                        options.push(("memory", v.to_string()));
                    }
                }
                "tags" => {
                    if let Some(tags) = value.as_array() {
                        let joined: Vec<&str> = tags.iter().filter_map(|t| t.as_str()).collect();
                        options.push(("tags", joined.join(";")));
                    }
                }
                "disk_gb" => {
                    if let Some(v) = value.as_u64() {
                        self.pvesh.resize_disk(vm.vmid, "scsi0", v as u32).await?;
                    }
                }
                other => {
                    tracing::warn!(vm = name, field = other, "ignoring non-updatable field");
                }
            }
        }

        if !options.is_empty() {
            self.pvesh.set_config(vm.vmid, &options).await?;
        }
        Ok(())
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        let Some(vm) = self.pvesh.find_vm(name).await? else {
            tracing::debug!(vm = name, "already gone");
            return Ok(());
        };

        if vm.is_running() {
            self.pvesh.stop_vm(vm.vmid).await?;
        }
        self.pvesh.delete_vm(vm.vmid).await?;
        if let Err(e) = self.pvesh.remove_snippet(&snippet_name(name)).await {
            tracing::warn!(vm = name, error = %e, "could not remove cloud-init snippet");
        }
        tracing::info!(vm = name, vmid = vm.vmid, "deleted VM");
        Ok(())
    }
}

#[async_trait]
impl Provider for ProxmoxProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn create(&self, spec: &ResourceSpec) -> std::result::Result<CreatedResource, ProviderError> {
        if spec.kind != ResourceKind::Vm {
            return Err(ProxmoxError::UnsupportedKind(spec.kind.to_string()).into());
        }
        Ok(self.create_vm(spec).await?)
    }

    async fn read(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> std::result::Result<Option<Attributes>, ProviderError> {
        if kind != ResourceKind::Vm {
            return Err(ProxmoxError::UnsupportedKind(kind.to_string()).into());
        }
        let Some(vm) = self.pvesh.find_vm(name).await.map_err(ProviderError::from)? else {
            return Ok(None);
        };

        let mut attrs = Attributes::new();
        attrs.insert("vmid".to_string(), serde_json::json!(vm.vmid));
        if let Some(status) = &vm.status {
            attrs.insert("status".to_string(), serde_json::json!(status));
        }
        Ok(Some(attrs))
    }

    async fn update(
        &self,
        kind: ResourceKind,
        name: &str,
        changes: &Attributes,
    ) -> std::result::Result<(), ProviderError> {
        if kind != ResourceKind::Vm {
            return Err(ProxmoxError::UnsupportedKind(kind.to_string()).into());
        }
        Ok(self.update_vm(name, changes).await?)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
    ) -> std::result::Result<(), ProviderError> {
        if kind != ResourceKind::Vm {
            return Err(ProxmoxError::UnsupportedKind(kind.to_string()).into());
        }
        Ok(self.delete_vm(name).await?)
    }
}
