//! Cloud-init user-data generation
//!
//! Renders the nocloud user-data injected into each cloned VM. Every
//! node gets the admin user, the cluster SSH key and the qemu guest
//! agent; control-plane nodes additionally open the k3s API port.

use crate::error::{ProxmoxError, Result};
use tera::{Context, Tera};

const USER_DATA_TEMPLATE: &str = r#"#cloud-config
hostname: {{ hostname }}
fqdn: {{ hostname }}.home.lab
users:
  - name: admin
    groups: wheel
    sudo: ALL=(ALL) NOPASSWD:ALL
    shell: /bin/bash
    ssh_authorized_keys:
      - {{ ssh_public_key }}
packages:
  - qemu-guest-agent
{%- if role == "server" %}
  - firewalld
runcmd:
  - systemctl enable --now qemu-guest-agent
  - firewall-cmd --permanent --add-port=6443/tcp
  - firewall-cmd --reload
{%- else %}
runcmd:
  - systemctl enable --now qemu-guest-agent
{%- endif %}
"#;

/// Render user-data for one VM.
pub fn render_user_data(hostname: &str, role: &str, ssh_public_key: &str) -> Result<String> {
    let mut context = Context::new();
    context.insert("hostname", hostname);
    context.insert("role", role);
    context.insert("ssh_public_key", ssh_public_key);

    Tera::one_off(USER_DATA_TEMPLATE, &context, false)
        .map_err(|e| ProxmoxError::Template(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_basic_user_data() {
        let data = render_user_data("k3s-worker-01", "agent", "ssh-ed25519 AAAA t@l").unwrap();
        assert!(data.starts_with("#cloud-config"));
        assert!(data.contains("hostname: k3s-worker-01"));
        assert!(data.contains("ssh-ed25519 AAAA t@l"));
        assert!(!data.contains("6443"));
    }

    #[test]
    fn server_role_opens_api_port() {
        let data = render_user_data("k3s-master-01", "server", "ssh-ed25519 AAAA t@l").unwrap();
        assert!(data.contains("6443/tcp"));
        assert!(data.contains("firewalld"));
    }
}
