use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

pub const DEFAULT_CONTROLLER_URL: &str = "http://localhost:8008";
pub const DEFAULT_INTERFACE: &str = "hubnet";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub const DEFAULT_CONFIG_REFRESH_SECS: u64 = 300;
pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;
pub const DEFAULT_MTU: u16 = 1420;

#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Hub,
    Spoke,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Hub => "hub",
            NodeType::Spoke => "spoke",
        }
    }
}

/// Persistent agent state. The private key is generated exactly once on
/// first start and never leaves this file.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    pub controller_url: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub keepalive: u16,
    pub mtu: u16,
    pub interface: String,
    pub token: Option<String>,
    pub private_key: String,
    pub public_key: String,
    pub node_id: Option<String>,
    pub heartbeat_secs: u64,
    pub config_refresh_secs: u64,
}

pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("no home directory"))?;
    Ok(home.join(".hubnet").join("agent.json"))
}

pub fn generate_keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    let private_key = STANDARD.encode(secret.to_bytes());
    let public_key = STANDARD.encode(public.to_bytes());

    (private_key, public_key)
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Option<AgentConfig>> {
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let cfg = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(cfg))
    }

    /// Writes the config with owner-only permissions via a temp file in
    /// the same directory, so a crash never leaves a torn file behind.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(self)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("agent.json");
        let tmp = path.with_file_name(format!(".{}.tmp", name));

        fs::write(&tmp, &json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentConfig {
        let (private_key, public_key) = generate_keypair();
        AgentConfig {
            controller_url: DEFAULT_CONTROLLER_URL.into(),
            node_name: "edge-1".into(),
            node_type: NodeType::Spoke,
            endpoint: None,
            port: None,
            keepalive: DEFAULT_KEEPALIVE_SECS,
            mtu: DEFAULT_MTU,
            interface: DEFAULT_INTERFACE.into(),
            token: None,
            private_key,
            public_key,
            node_id: None,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            config_refresh_secs: DEFAULT_CONFIG_REFRESH_SECS,
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");

        let mut cfg = sample();
        cfg.persist(&path).unwrap();

        let loaded = AgentConfig::load(&path).unwrap().unwrap();
        assert_eq!(loaded.node_name, cfg.node_name);
        assert_eq!(loaded.public_key, cfg.public_key);
        assert_eq!(loaded.node_id, None);

        cfg.node_id = Some("abc123".into());
        cfg.persist(&path).unwrap();
        let reloaded = AgentConfig::load(&path).unwrap().unwrap();
        assert_eq!(reloaded.node_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn config_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");

        sample().persist(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AgentConfig::load(&dir.path().join("absent.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn keypair_is_base64_curve25519() {
        let (private_key, public_key) = generate_keypair();
        assert_eq!(STANDARD.decode(&private_key).unwrap().len(), 32);
        assert_eq!(STANDARD.decode(&public_key).unwrap().len(), 32);
        // A fresh pair is generated each call.
        assert_ne!(generate_keypair().1, public_key);
    }
}
