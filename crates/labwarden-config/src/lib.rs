//! labwarden configuration
//!
//! Finds and parses `lab.kdl`, then validates it into the immutable
//! [`DesiredState`](labwarden_core::DesiredState) the reconciler
//! consumes.

pub mod builder;
pub mod model;
pub mod parser;

pub use builder::{build_desired_state, EDGE_LB, EDGE_NODE, LINODE_PROVIDER, PROXMOX_PROVIDER};
pub use model::{ClusterConfig, EdgeConfig, LabConfig, Secrets, VmDef};
pub use parser::{parse_kdl_file, parse_kdl_string};

use labwarden_core::{ConfigError, DesiredState};
use std::path::{Path, PathBuf};

/// 設定ファイルを探す
///
/// 検索順序:
/// 1. 環境変数 LAB_CONFIG_PATH (直接パス指定)
/// 2. カレントディレクトリ: lab.local.kdl, .lab.local.kdl, lab.kdl, .lab.kdl
/// 3. ./.labwarden/ ディレクトリ内: 同様の順序
/// 4. ~/.config/labwarden/lab.kdl (グローバル設定)
pub fn find_config_file() -> Result<PathBuf, ConfigError> {
    if let Ok(config_path) = std::env::var("LAB_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    let candidates = ["lab.local.kdl", ".lab.local.kdl", "lab.kdl", ".lab.kdl"];

    for filename in &candidates {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let warden_dir = current_dir.join(".labwarden");
    if warden_dir.is_dir() {
        for filename in &candidates {
            let path = warden_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("labwarden").join("lab.kdl");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::FileNotFound)
}

/// Parse and validate a config file in one step.
pub fn load_desired_state<P: AsRef<Path>>(
    path: P,
    secrets: &Secrets,
) -> Result<DesiredState, ConfigError> {
    let config = parse_kdl_file(path.as_ref())?;
    tracing::debug!(
        path = %path.as_ref().display(),
        vms = config.cluster.vms.len(),
        edge = config.edge.is_some(),
        "loaded configuration"
    );
    build_desired_state(&config, secrets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const MINIMAL: &str = r#"
cluster "lab" {
    node "pve"
    template_vmid 9000
    gateway "10.0.0.1"
    ssh_public_key "ssh-ed25519 AAAA t@l"

    vm "a" {
        vmid 100
        ip "10.0.0.10"
    }
}
"#;

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.kdl");
        fs::write(&path, MINIMAL).unwrap();

        let state = load_desired_state(&path, &Secrets::default()).unwrap();
        assert_eq!(state.resources().len(), 1);
        assert_eq!(state.settings().node_name, "pve");
    }
}
