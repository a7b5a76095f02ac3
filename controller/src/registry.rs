use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ipnet::Ipv4Net;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::pool::AddressPool;

pub const DEFAULT_KEEPALIVE_SECS: u16 = 25;
pub const DEFAULT_MTU: u16 = 1420;
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Hub,
    Spoke,
}

impl FromStr for NodeRole {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hub" => Ok(NodeRole::Hub),
            "spoke" => Ok(NodeRole::Spoke),
            _ => Err(ApiError::InvalidRole),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Active,
    Inactive,
    Disabled,
}

/// A registered overlay endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub role: NodeRole,
    pub public_key: String,
    #[serde(rename = "allocatedAddress")]
    pub address: Ipv4Addr,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub keepalive: u16,
    pub mtu: u16,
    pub status: NodeStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Creation order, used for deterministic hub tie-breaking. Not part
    // of the wire format; restored from created_at on rehydration.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Node {
    /// The `host:port` peers dial to reach this node, when known.
    pub fn listen_endpoint(&self) -> Option<String> {
        self.endpoint
            .as_deref()
            .map(|host| format_endpoint(host, self.port.unwrap_or(DEFAULT_LISTEN_PORT)))
    }

    pub fn listen_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_LISTEN_PORT)
    }

    fn is_attachable_hub(&self) -> bool {
        self.role == NodeRole::Hub
            && matches!(self.status, NodeStatus::Pending | NodeStatus::Active)
    }
}

pub fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn validate_public_key(key: &str) -> Result<(), ApiError> {
    match STANDARD.decode(key) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(ApiError::InvalidKey),
    }
}

fn new_node_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub name: String,
    pub role: NodeRole,
    pub public_key: String,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub keepalive: Option<u16>,
    pub mtu: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct NodePatch {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub keepalive: Option<u16>,
    pub status: Option<NodeStatus>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub role: Option<NodeRole>,
    pub status: Option<NodeStatus>,
}

/// Authoritative store of nodes and the spoke→hub attachment graph.
///
/// All mutations run under one exclusive lock held by the caller (the
/// invariants span nodes, edges and the address pool); reads clone a
/// consistent snapshot while the lock is held.
#[derive(Debug)]
pub struct Registry {
    nodes: HashMap<String, Node>,
    /// spoke id → hub id. A spoke appears at most once by construction.
    attachments: HashMap<String, String>,
    pool: AddressPool,
    next_seq: u64,
}

impl Registry {
    pub fn new(subnet: Ipv4Net) -> Self {
        Self {
            nodes: HashMap::new(),
            attachments: HashMap::new(),
            pool: AddressPool::new(subnet),
            next_seq: 0,
        }
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.pool.subnet()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get(&self, id: &str) -> Result<Node, ApiError> {
        self.nodes.get(id).cloned().ok_or(ApiError::NodeNotFound)
    }

    pub fn list(&self, filter: ListFilter) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .values()
            .filter(|n| filter.role.map_or(true, |r| n.role == r))
            .filter(|n| filter.status.map_or(true, |s| n.status == s))
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The hub a spoke is currently attached to.
    pub fn hub_of(&self, spoke_id: &str) -> Option<&Node> {
        self.attachments
            .get(spoke_id)
            .and_then(|hub_id| self.nodes.get(hub_id))
    }

    /// Spokes attached to a hub, in creation order.
    pub fn spokes_of(&self, hub_id: &str) -> Vec<&Node> {
        let mut spokes: Vec<&Node> = self
            .attachments
            .iter()
            .filter(|(_, h)| h.as_str() == hub_id)
            .filter_map(|(s, _)| self.nodes.get(s))
            .collect();
        spokes.sort_by_key(|n| n.seq);
        spokes
    }

    pub fn attachment_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .attachments
            .iter()
            .map(|(spoke, hub)| (hub.clone(), spoke.clone()))
            .collect();
        pairs.sort();
        pairs
    }

    pub fn register(&mut self, req: RegisterRequest) -> Result<Node, ApiError> {
        validate_public_key(&req.public_key)?;

        if self.nodes.values().any(|n| n.name == req.name) {
            return Err(ApiError::NameTaken);
        }
        if self.nodes.values().any(|n| n.public_key == req.public_key) {
            return Err(ApiError::KeyTaken);
        }
        if req.role == NodeRole::Hub && req.endpoint.is_none() {
            return Err(ApiError::EndpointRequired);
        }

        // All validations passed; the allocation cannot be orphaned by a
        // later failure in this path.
        let address = self.pool.allocate()?;

        let now = Utc::now();
        let mut id = new_node_id();
        while self.nodes.contains_key(&id) {
            id = new_node_id();
        }

        let node = Node {
            id: id.clone(),
            name: req.name,
            role: req.role,
            public_key: req.public_key,
            address,
            endpoint: req.endpoint,
            port: req.port,
            keepalive: req.keepalive.unwrap_or(DEFAULT_KEEPALIVE_SECS),
            mtu: req.mtu.unwrap_or(DEFAULT_MTU),
            status: NodeStatus::Pending,
            last_seen: None,
            created_at: now,
            updated_at: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        info!(
            node = %node.name,
            id = %node.id,
            role = ?node.role,
            address = %node.address,
            "registered node"
        );

        self.nodes.insert(id.clone(), node.clone());

        match node.role {
            NodeRole::Spoke => self.try_attach(&id),
            // A new hub is immediately attachable; pick up any spokes
            // waiting for one.
            NodeRole::Hub => self.attach_orphans(),
        }

        Ok(self.nodes[&id].clone())
    }

    pub fn update(&mut self, id: &str, patch: NodePatch) -> Result<Node, ApiError> {
        let current = self.nodes.get(id).ok_or(ApiError::NodeNotFound)?;

        // Reject up front so a failed liveness report leaves no partial
        // patch behind.
        if patch.status == Some(NodeStatus::Active) && current.status == NodeStatus::Disabled {
            return Err(ApiError::NodeDisabled);
        }

        if let Some(name) = &patch.name {
            if self.nodes.values().any(|n| n.id != id && &n.name == name) {
                return Err(ApiError::NameTaken);
            }
        }

        {
            let node = self.nodes.get_mut(id).expect("checked above");
            if let Some(name) = patch.name {
                node.name = name;
            }
            if let Some(endpoint) = patch.endpoint {
                node.endpoint = Some(endpoint);
            }
            if let Some(port) = patch.port {
                node.port = Some(port);
            }
            if let Some(keepalive) = patch.keepalive {
                node.keepalive = keepalive;
            }
            node.updated_at = Utc::now();
        }

        match patch.status {
            Some(NodeStatus::Active) => {
                // An "active" status report is the liveness path.
                self.report_liveness(id, Utc::now())?;
            }
            Some(NodeStatus::Disabled) => self.disable(id),
            Some(NodeStatus::Pending) => self.re_enable(id),
            // INACTIVE is owned by the sweep, never set explicitly.
            Some(NodeStatus::Inactive) | None => {}
        }

        Ok(self.nodes[id].clone())
    }

    pub fn delete(&mut self, id: &str) -> Result<(), ApiError> {
        let node = self.nodes.remove(id).ok_or(ApiError::NodeNotFound)?;

        self.pool.release(node.address);
        self.attachments.remove(id);

        if node.role == NodeRole::Hub {
            self.reattach_spokes_of(id);
        }

        info!(node = %node.name, id = %id, address = %node.address, "deleted node");
        Ok(())
    }

    /// Records a liveness report. Drives `PENDING/INACTIVE → ACTIVE`;
    /// does not otherwise change status.
    pub fn report_liveness(&mut self, id: &str, now: DateTime<Utc>) -> Result<Node, ApiError> {
        let node = self.nodes.get_mut(id).ok_or(ApiError::NodeNotFound)?;
        if node.status == NodeStatus::Disabled {
            return Err(ApiError::NodeDisabled);
        }

        node.last_seen = Some(now);
        node.updated_at = now;

        let became_active = matches!(node.status, NodeStatus::Pending | NodeStatus::Inactive);
        if became_active {
            node.status = NodeStatus::Active;
        }
        let role = node.role;
        let id = node.id.clone();

        if became_active {
            match role {
                // A hub returning from INACTIVE becomes attachable again.
                NodeRole::Hub => self.attach_orphans(),
                NodeRole::Spoke => self.try_attach(&id),
            }
        }

        Ok(self.nodes[&id].clone())
    }

    /// Marks ACTIVE nodes unseen for longer than `threshold` as INACTIVE.
    /// Returns the number of nodes transitioned.
    pub fn sweep_inactive(&mut self, now: DateTime<Utc>, threshold: Duration) -> usize {
        let stale: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .filter(|n| match n.last_seen {
                Some(seen) => now - seen > threshold,
                None => true,
            })
            .map(|n| n.id.clone())
            .collect();

        for id in &stale {
            let node = self.nodes.get_mut(id).expect("collected above");
            node.status = NodeStatus::Inactive;
            node.updated_at = now;
            info!(node = %node.name, id = %id, "node went inactive");

            if node.role == NodeRole::Hub {
                self.reattach_spokes_of(id);
            }
        }

        stale.len()
    }

    fn disable(&mut self, id: &str) {
        let node = self.nodes.get_mut(id).expect("caller checked");
        if node.status == NodeStatus::Disabled {
            return;
        }
        node.status = NodeStatus::Disabled;
        let role = node.role;
        let name = node.name.clone();

        // Edges never involve a DISABLED endpoint. The address is
        // retained until deletion.
        self.attachments.remove(id);
        if role == NodeRole::Hub {
            self.reattach_spokes_of(id);
        }

        info!(node = %name, id = %id, "node disabled");
    }

    fn re_enable(&mut self, id: &str) {
        let node = self.nodes.get_mut(id).expect("caller checked");
        if node.status != NodeStatus::Disabled {
            return;
        }
        node.status = NodeStatus::Pending;
        node.last_seen = None;
        let role = node.role;

        match role {
            NodeRole::Hub => self.attach_orphans(),
            NodeRole::Spoke => self.try_attach(id),
        }
    }

    /// Attaches a spoke to the oldest attachable hub, if any. No-op when
    /// the spoke is already attached or disabled.
    fn try_attach(&mut self, spoke_id: &str) {
        if self.attachments.contains_key(spoke_id) {
            return;
        }
        match self.nodes.get(spoke_id) {
            Some(n) if n.role == NodeRole::Spoke && n.status != NodeStatus::Disabled => {}
            _ => return,
        }

        let hub = self
            .nodes
            .values()
            .filter(|n| n.is_attachable_hub())
            .min_by_key(|n| n.seq)
            .map(|n| (n.id.clone(), n.name.clone()));

        if let Some((hub_id, hub_name)) = hub {
            info!(spoke = %spoke_id, hub = %hub_name, "attached spoke");
            self.attachments.insert(spoke_id.to_string(), hub_id);
        }
    }

    /// Re-evaluates every unattached, non-disabled spoke in creation
    /// order. Called whenever a hub becomes attachable.
    fn attach_orphans(&mut self) {
        let mut orphans: Vec<(u64, String)> = self
            .nodes
            .values()
            .filter(|n| n.role == NodeRole::Spoke && n.status != NodeStatus::Disabled)
            .filter(|n| !self.attachments.contains_key(&n.id))
            .map(|n| (n.seq, n.id.clone()))
            .collect();
        orphans.sort();

        for (_, id) in orphans {
            self.try_attach(&id);
        }
    }

    /// Detaches every spoke of a hub that stopped being attachable and
    /// re-homes each onto another hub where possible.
    fn reattach_spokes_of(&mut self, hub_id: &str) {
        let mut detached: Vec<(u64, String)> = self
            .attachments
            .iter()
            .filter(|(_, h)| h.as_str() == hub_id)
            .filter_map(|(s, _)| self.nodes.get(s))
            .map(|n| (n.seq, n.id.clone()))
            .collect();
        detached.sort();

        for (_, spoke_id) in &detached {
            self.attachments.remove(spoke_id);
        }
        for (_, spoke_id) in detached {
            self.try_attach(&spoke_id);
        }
    }

    // ------------------------------------------------------------------
    // Persistence hooks
    // ------------------------------------------------------------------

    pub fn export_nodes(&self) -> Vec<Node> {
        self.list(ListFilter::default())
    }

    /// Rebuilds a registry from persisted nodes and attachment pairs.
    /// Creation order is re-derived from `(created_at, id)`; addresses
    /// that no longer fit the configured subnet are dropped with a
    /// warning by the caller.
    pub fn restore(
        subnet: Ipv4Net,
        mut nodes: Vec<Node>,
        attachments: Vec<(String, String)>,
    ) -> (Self, Vec<String>) {
        let mut registry = Registry::new(subnet);
        let mut rejected = Vec::new();

        nodes.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        for mut node in nodes {
            if registry.pool.reserve(node.address).is_err() {
                rejected.push(node.id.clone());
                continue;
            }
            node.seq = registry.next_seq;
            registry.next_seq += 1;
            registry.nodes.insert(node.id.clone(), node);
        }

        for (hub_id, spoke_id) in attachments {
            let valid = registry.nodes.get(&hub_id).is_some_and(|h| {
                h.role == NodeRole::Hub && h.status != NodeStatus::Disabled
            }) && registry.nodes.get(&spoke_id).is_some_and(|s| {
                s.role == NodeRole::Spoke && s.status != NodeStatus::Disabled
            });
            if valid && !registry.attachments.contains_key(&spoke_id) {
                registry.attachments.insert(spoke_id, hub_id);
            }
        }

        // Spokes whose hub disappeared between runs get re-homed.
        registry.attach_orphans();

        (registry, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet() -> Ipv4Net {
        "10.100.0.0/16".parse().unwrap()
    }

    fn key(tag: u8) -> String {
        STANDARD.encode([tag; 32])
    }

    fn register_hub(reg: &mut Registry, name: &str, tag: u8) -> Node {
        reg.register(RegisterRequest {
            name: name.into(),
            role: NodeRole::Hub,
            public_key: key(tag),
            endpoint: Some("h.example.com".into()),
            port: Some(51820),
            keepalive: None,
            mtu: None,
        })
        .unwrap()
    }

    fn register_spoke(reg: &mut Registry, name: &str, tag: u8) -> Node {
        reg.register(RegisterRequest {
            name: name.into(),
            role: NodeRole::Spoke,
            public_key: key(tag),
            endpoint: None,
            port: None,
            keepalive: None,
            mtu: None,
        })
        .unwrap()
    }

    #[test]
    fn hub_then_spokes_get_sequential_addresses() {
        let mut reg = Registry::new(subnet());
        let h = register_hub(&mut reg, "H", 1);
        let a = register_spoke(&mut reg, "A", 2);
        let b = register_spoke(&mut reg, "B", 3);

        assert_eq!(h.address, "10.100.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(a.address, "10.100.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b.address, "10.100.0.3".parse::<Ipv4Addr>().unwrap());

        assert_eq!(reg.hub_of(&a.id).unwrap().id, h.id);
        assert_eq!(reg.hub_of(&b.id).unwrap().id, h.id);
    }

    #[test]
    fn deleted_address_is_reused_by_next_registration() {
        let mut reg = Registry::new(subnet());
        register_hub(&mut reg, "H", 1);
        let a = register_spoke(&mut reg, "A", 2);
        register_spoke(&mut reg, "B", 3);

        reg.delete(&a.id).unwrap();
        let c = register_spoke(&mut reg, "C", 4);
        assert_eq!(c.address, "10.100.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn duplicate_name_and_key_are_rejected() {
        let mut reg = Registry::new(subnet());
        register_hub(&mut reg, "H", 1);

        let dup_name = reg.register(RegisterRequest {
            name: "H".into(),
            role: NodeRole::Spoke,
            public_key: key(9),
            endpoint: None,
            port: None,
            keepalive: None,
            mtu: None,
        });
        assert_eq!(dup_name.unwrap_err(), ApiError::NameTaken);

        let dup_key = reg.register(RegisterRequest {
            name: "other".into(),
            role: NodeRole::Spoke,
            public_key: key(1),
            endpoint: None,
            port: None,
            keepalive: None,
            mtu: None,
        });
        assert_eq!(dup_key.unwrap_err(), ApiError::KeyTaken);

        // Failed registrations must not leak addresses.
        let c = register_spoke(&mut reg, "C", 5);
        assert_eq!(c.address, "10.100.0.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn malformed_public_key_is_rejected() {
        let mut reg = Registry::new(subnet());
        let res = reg.register(RegisterRequest {
            name: "n".into(),
            role: NodeRole::Spoke,
            public_key: "not-base64!".into(),
            endpoint: None,
            port: None,
            keepalive: None,
            mtu: None,
        });
        assert_eq!(res.unwrap_err(), ApiError::InvalidKey);

        let short = reg.register(RegisterRequest {
            name: "n".into(),
            role: NodeRole::Spoke,
            public_key: STANDARD.encode([0u8; 16]),
            endpoint: None,
            port: None,
            keepalive: None,
            mtu: None,
        });
        assert_eq!(short.unwrap_err(), ApiError::InvalidKey);
    }

    #[test]
    fn hub_without_endpoint_is_rejected() {
        let mut reg = Registry::new(subnet());
        let res = reg.register(RegisterRequest {
            name: "H".into(),
            role: NodeRole::Hub,
            public_key: key(1),
            endpoint: None,
            port: None,
            keepalive: None,
            mtu: None,
        });
        assert_eq!(res.unwrap_err(), ApiError::EndpointRequired);
    }

    #[test]
    fn pool_exhaustion_surfaces() {
        let mut reg = Registry::new("10.100.0.0/30".parse().unwrap());
        register_hub(&mut reg, "H", 1);
        register_spoke(&mut reg, "A", 2);

        let res = reg.register(RegisterRequest {
            name: "B".into(),
            role: NodeRole::Spoke,
            public_key: key(3),
            endpoint: None,
            port: None,
            keepalive: None,
            mtu: None,
        });
        assert_eq!(res.unwrap_err(), ApiError::PoolExhausted);
    }

    #[test]
    fn spoke_attaches_to_oldest_hub_and_fails_over() {
        let mut reg = Registry::new(subnet());
        let h1 = register_hub(&mut reg, "H1", 1);
        let h2 = register_hub(&mut reg, "H2", 2);
        let a = register_spoke(&mut reg, "A", 3);

        assert_eq!(reg.hub_of(&a.id).unwrap().id, h1.id);

        reg.update(
            &h1.id,
            NodePatch {
                status: Some(NodeStatus::Disabled),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(reg.hub_of(&a.id).unwrap().id, h2.id);
    }

    #[test]
    fn spoke_unattached_without_hub_then_picked_up() {
        let mut reg = Registry::new(subnet());
        let a = register_spoke(&mut reg, "A", 1);
        assert!(reg.hub_of(&a.id).is_none());

        let h = register_hub(&mut reg, "H", 2);
        assert_eq!(reg.hub_of(&a.id).unwrap().id, h.id);
    }

    #[test]
    fn no_spoke_to_spoke_or_self_edges() {
        let mut reg = Registry::new(subnet());
        register_spoke(&mut reg, "A", 1);
        let b = register_spoke(&mut reg, "B", 2);

        // With only spokes present nothing can attach.
        assert!(reg.attachment_pairs().is_empty());

        let h = register_hub(&mut reg, "H", 3);
        for (hub, spoke) in reg.attachment_pairs() {
            assert_eq!(hub, h.id);
            assert_ne!(hub, spoke);
        }
        assert_eq!(reg.hub_of(&b.id).unwrap().role, NodeRole::Hub);
    }

    #[test]
    fn liveness_drives_status_machine() {
        let mut reg = Registry::new(subnet());
        let h = register_hub(&mut reg, "H", 1);
        assert_eq!(reg.get(&h.id).unwrap().status, NodeStatus::Pending);

        let now = Utc::now();
        reg.report_liveness(&h.id, now).unwrap();
        assert_eq!(reg.get(&h.id).unwrap().status, NodeStatus::Active);

        // Stale node goes inactive on sweep, then back to active on the
        // next report.
        let later = now + Duration::seconds(300);
        assert_eq!(reg.sweep_inactive(later, Duration::seconds(90)), 1);
        assert_eq!(reg.get(&h.id).unwrap().status, NodeStatus::Inactive);

        reg.report_liveness(&h.id, later).unwrap();
        assert_eq!(reg.get(&h.id).unwrap().status, NodeStatus::Active);
    }

    #[test]
    fn sweep_of_hub_rehomes_spokes() {
        let mut reg = Registry::new(subnet());
        let h1 = register_hub(&mut reg, "H1", 1);
        let h2 = register_hub(&mut reg, "H2", 2);
        let a = register_spoke(&mut reg, "A", 3);

        let now = Utc::now();
        reg.report_liveness(&h1.id, now).unwrap();
        reg.report_liveness(&h2.id, now).unwrap();

        // Only H1 goes stale.
        reg.report_liveness(&h2.id, now + Duration::seconds(300)).unwrap();
        reg.sweep_inactive(now + Duration::seconds(300), Duration::seconds(90));

        assert_eq!(reg.get(&h1.id).unwrap().status, NodeStatus::Inactive);
        assert_eq!(reg.hub_of(&a.id).unwrap().id, h2.id);
    }

    #[test]
    fn disabled_node_rejects_liveness_and_keeps_address() {
        let mut reg = Registry::new(subnet());
        let h = register_hub(&mut reg, "H", 1);
        let a = register_spoke(&mut reg, "A", 2);

        reg.update(
            &a.id,
            NodePatch {
                status: Some(NodeStatus::Disabled),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(
            reg.report_liveness(&a.id, Utc::now()).unwrap_err(),
            ApiError::NodeDisabled
        );
        assert!(reg.hub_of(&a.id).is_none());

        // Address retained while disabled: the next registration skips it.
        let b = register_spoke(&mut reg, "B", 3);
        assert_eq!(b.address, "10.100.0.3".parse::<Ipv4Addr>().unwrap());

        // Re-enable puts the spoke back into PENDING and re-attaches.
        reg.update(
            &a.id,
            NodePatch {
                status: Some(NodeStatus::Pending),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(reg.get(&a.id).unwrap().status, NodeStatus::Pending);
        assert_eq!(reg.hub_of(&a.id).unwrap().id, h.id);
    }

    #[test]
    fn update_rejects_taken_name_and_keeps_immutables() {
        let mut reg = Registry::new(subnet());
        let h = register_hub(&mut reg, "H", 1);
        let a = register_spoke(&mut reg, "A", 2);

        let res = reg.update(
            &a.id,
            NodePatch {
                name: Some("H".into()),
                ..Default::default()
            },
        );
        assert_eq!(res.unwrap_err(), ApiError::NameTaken);

        let updated = reg
            .update(
                &a.id,
                NodePatch {
                    keepalive: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.keepalive, 0);
        assert_eq!(updated.public_key, key(2));
        assert_eq!(updated.address, a.address);
        let _ = h;
    }

    #[test]
    fn restore_round_trips_and_reserves_addresses() {
        let mut reg = Registry::new(subnet());
        let h = register_hub(&mut reg, "H", 1);
        let a = register_spoke(&mut reg, "A", 2);

        let nodes = reg.export_nodes();
        let pairs = reg.attachment_pairs();

        let (restored, rejected) = Registry::restore(subnet(), nodes, pairs);
        assert!(rejected.is_empty());
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.hub_of(&a.id).unwrap().id, h.id);

        // The restored pool must treat persisted addresses as taken.
        let mut restored = restored;
        let fresh = register_spoke(&mut restored, "B", 3);
        assert_eq!(fresh.address, "10.100.0.3".parse::<Ipv4Addr>().unwrap());
    }
}
