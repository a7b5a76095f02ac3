use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::registry::{NodeRole, NodeStatus, Registry};

/// The node's own interface parameters. The private key is deliberately
/// absent: it never leaves the node that owns it, and the agent fills it
/// in locally when rendering the tunnel file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceParams {
    pub address: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    pub mtu: u16,
}

/// One tunnel peer as the target node must program it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub public_key: String,
    #[serde(rename = "allowedIPs")]
    pub allowed_ips: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub interface: InterfaceParams,
    pub peers: Vec<PeerEntry>,
}

/// Derives the tunnel configuration for one node from the registry
/// snapshot the caller holds the lock over. Pure function of that state:
/// equal registries yield byte-equal configs.
pub fn synthesize(registry: &Registry, id: &str) -> Result<NodeConfig, ApiError> {
    let node = registry.node(id).ok_or(ApiError::NodeNotFound)?;
    if node.status == NodeStatus::Disabled {
        return Err(ApiError::NodeDisabled);
    }

    let prefix_len = registry.subnet().prefix_len();
    let interface = InterfaceParams {
        address: vec![format!("{}/{}", node.address, prefix_len)],
        listen_port: match node.role {
            NodeRole::Hub => Some(node.listen_port()),
            NodeRole::Spoke => None,
        },
        mtu: node.mtu,
    };

    let peers = match node.role {
        // A hub carries one peer per attached, non-disabled spoke and
        // routes exactly that spoke's overlay address toward it.
        NodeRole::Hub => registry
            .spokes_of(id)
            .into_iter()
            .filter(|s| s.status != NodeStatus::Disabled)
            .map(|s| PeerEntry {
                public_key: s.public_key.clone(),
                allowed_ips: vec![format!("{}/32", s.address)],
                endpoint: s.listen_endpoint(),
                keepalive: (s.keepalive != 0).then_some(s.keepalive),
            })
            .collect(),

        // A spoke sends everything to its hub. Unattached spokes get an
        // empty peer set: tunnel up, no peers.
        NodeRole::Spoke => match registry.hub_of(id) {
            Some(hub) => vec![PeerEntry {
                public_key: hub.public_key.clone(),
                allowed_ips: vec!["0.0.0.0/0".to_string()],
                endpoint: hub.listen_endpoint(),
                keepalive: (node.keepalive != 0).then_some(node.keepalive),
            }],
            None => Vec::new(),
        },
    };

    Ok(NodeConfig { interface, peers })
}
