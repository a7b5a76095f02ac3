use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::registry::{Node, Registry};

/// On-disk snapshot of the registry: the node rows plus the
/// `(hubId, spokeId)` attachment pairs. Deleted nodes are simply absent.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub nodes: Vec<Node>,
    pub attachments: Vec<(String, String)>,
}

/// Writes the registry snapshot via temp-file-then-rename so readers
/// never observe a torn file. Unchanged content is skipped.
pub fn save(registry: &Registry, path: &Path) -> Result<()> {
    let snapshot = StateSnapshot {
        nodes: registry.export_nodes(),
        attachments: registry.attachment_pairs(),
    };
    let contents = serde_json::to_vec_pretty(&snapshot)?;

    if let Ok(existing) = fs::read(path) {
        if existing == contents {
            return Ok(());
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &contents)
        .with_context(|| format!("writing state snapshot to {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("replacing state snapshot at {}", path.display()))?;

    Ok(())
}

/// Loads a snapshot if one exists, rehydrating the address pool through
/// `reserve`. Nodes whose address no longer fits the configured subnet
/// (or collides) are dropped with a warning.
pub fn load(subnet: Ipv4Net, path: &Path) -> Result<Registry> {
    if !path.exists() {
        return Ok(Registry::new(subnet));
    }

    let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let snapshot: StateSnapshot =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let (registry, rejected) = Registry::restore(subnet, snapshot.nodes, snapshot.attachments);
    for id in &rejected {
        warn!(node = %id, "dropped persisted node: address not reservable in {subnet}");
    }

    info!(
        nodes = registry.len(),
        path = %path.display(),
        "restored registry state"
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeRole, RegisterRequest};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn key(tag: u8) -> String {
        STANDARD.encode([tag; 32])
    }

    fn sample_registry() -> Registry {
        let mut reg = Registry::new("10.100.0.0/16".parse().unwrap());
        reg.register(RegisterRequest {
            name: "H".into(),
            role: NodeRole::Hub,
            public_key: key(1),
            endpoint: Some("h.example.com".into()),
            port: None,
            keepalive: None,
            mtu: None,
        })
        .unwrap();
        reg.register(RegisterRequest {
            name: "A".into(),
            role: NodeRole::Spoke,
            public_key: key(2),
            endpoint: None,
            port: None,
            keepalive: None,
            mtu: None,
        })
        .unwrap();
        reg
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let reg = sample_registry();
        save(&reg, &path).unwrap();

        let restored = load("10.100.0.0/16".parse().unwrap(), &path).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.attachment_pairs(), reg.attachment_pairs());
    }

    #[test]
    fn identical_snapshot_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let reg = sample_registry();
        save(&reg, &path).unwrap();
        let first = fs::metadata(&path).unwrap().modified().unwrap();

        save(&reg, &path).unwrap();
        let second = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_yields_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = load(
            "10.100.0.0/16".parse().unwrap(),
            &dir.path().join("absent.json"),
        )
        .unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn subnet_change_drops_out_of_range_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let reg = sample_registry();
        save(&reg, &path).unwrap();

        let restored = load("192.168.0.0/24".parse().unwrap(), &path).unwrap();
        assert!(restored.is_empty());
    }
}
