use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ApiError;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_secs(15);

/// Request timeout for replica-to-replica probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub node_id: String,
    pub cluster_id: String,
    /// Base URLs of the other replicas; empty for single-replica
    /// deployments, which are trivially leader.
    pub peers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthProbe {
    pub node_id: String,
    pub cluster_id: String,
    pub is_leader: bool,
    pub term: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub candidate_id: String,
    pub cluster_id: String,
    pub term: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub granted: bool,
    pub voter_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderAnnouncement {
    pub leader_id: String,
    pub cluster_id: String,
    pub term: i64,
}

#[derive(Debug, Clone)]
pub struct PeerState {
    pub url: String,
    pub node_id: Option<String>,
    pub claims_leader: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    /// Peer table keyed by base URL. Read-heavy: probed every heartbeat,
    /// consulted by every gated write.
    peers: HashMap<String, PeerState>,
    /// Leader identity learned from announcements.
    leader_id: Option<String>,
}

/// One replica's view of the controller cluster.
///
/// The protocol is deliberately lighter than Raft: terms are wall-clock
/// stamps, there is no log replication, and durability is delegated to
/// the store. It guarantees a single writer under quorum connectivity
/// and bounded failover, nothing more.
#[derive(Debug)]
pub struct Cluster {
    pub config: ClusterConfig,
    is_leader: AtomicBool,
    term: AtomicI64,
    inner: RwLock<Inner>,
}

impl Cluster {
    pub fn new(config: ClusterConfig) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|url| {
                (
                    url.clone(),
                    PeerState {
                        url: url.clone(),
                        node_id: None,
                        claims_leader: false,
                        last_seen: None,
                    },
                )
            })
            .collect();

        let single = config.peers.is_empty();
        if single {
            info!(node = %config.node_id, "single-replica cluster, assuming leadership");
        }

        let leader_id = single.then(|| config.node_id.clone());
        Self {
            config,
            is_leader: AtomicBool::new(single),
            term: AtomicI64::new(0),
            inner: RwLock::new(Inner {
                peers,
                leader_id,
            }),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn current_term(&self) -> i64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn replica_count(&self) -> usize {
        self.config.peers.len() + 1
    }

    /// Strict majority of all replicas.
    pub fn quorum(&self) -> usize {
        self.replica_count() / 2 + 1
    }

    /// Whether a candidate with `grants` peer votes (plus its own) wins.
    pub fn tally(&self, grants: usize) -> bool {
        grants + 1 >= self.quorum()
    }

    /// Gate for every mutating operation. Followers answer with the
    /// leader's address when the peer table knows it.
    pub fn ensure_leader(&self) -> Result<(), ApiError> {
        if self.is_leader() {
            return Ok(());
        }

        let now = Utc::now();
        if let Some(url) = self.leader_address(now) {
            return Err(ApiError::NotLeader { leader: Some(url) });
        }

        let known = self.inner.read().unwrap().leader_id.is_some();
        if known {
            Err(ApiError::NotLeader { leader: None })
        } else {
            Err(ApiError::NoLeaderAvailable)
        }
    }

    pub fn health_probe(&self) -> HealthProbe {
        HealthProbe {
            node_id: self.config.node_id.clone(),
            cluster_id: self.config.cluster_id.clone(),
            is_leader: self.is_leader(),
            term: self.current_term(),
        }
    }

    /// Records the outcome of one health probe round-trip. A failed
    /// probe leaves `last_seen` untouched; staleness marks the peer
    /// unhealthy on its own.
    pub fn observe_probe(&self, url: &str, probe: Option<HealthProbe>, now: DateTime<Utc>) {
        let Some(probe) = probe else { return };

        if probe.cluster_id != self.config.cluster_id {
            warn!(peer = %url, cluster = %probe.cluster_id, "probe from foreign cluster ignored");
            return;
        }

        let mut inner = self.inner.write().unwrap();
        if probe.is_leader {
            inner.leader_id = Some(probe.node_id.clone());
        }
        if let Some(peer) = inner.peers.get_mut(url) {
            peer.node_id = Some(probe.node_id);
            peer.claims_leader = probe.is_leader;
            peer.last_seen = Some(now);
        }
    }

    fn peer_healthy(&self, peer: &PeerState, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.config.heartbeat_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        peer.last_seen.is_some_and(|seen| now - seen <= window)
    }

    pub fn healthy_peers(&self, now: DateTime<Utc>) -> Vec<PeerState> {
        self.inner
            .read()
            .unwrap()
            .peers
            .values()
            .filter(|p| self.peer_healthy(p, now))
            .cloned()
            .collect()
    }

    /// The cluster is leaderless when neither this replica nor any
    /// healthy peer claims leadership.
    pub fn leaderless(&self, now: DateTime<Utc>) -> bool {
        if self.is_leader() {
            return false;
        }
        !self
            .healthy_peers(now)
            .iter()
            .any(|p| p.claims_leader)
    }

    fn leader_address(&self, now: DateTime<Utc>) -> Option<String> {
        let inner = self.inner.read().unwrap();

        if let Some(leader_id) = &inner.leader_id {
            if let Some(peer) = inner
                .peers
                .values()
                .find(|p| p.node_id.as_deref() == Some(leader_id.as_str()))
            {
                return Some(peer.url.clone());
            }
        }

        inner
            .peers
            .values()
            .filter(|p| self.peer_healthy(p, now))
            .find(|p| p.claims_leader)
            .map(|p| p.url.clone())
    }

    /// Grants when the cluster matches and this replica is not itself
    /// the leader.
    pub fn handle_vote(&self, req: &VoteRequest) -> VoteResponse {
        let granted = req.cluster_id == self.config.cluster_id && !self.is_leader();
        VoteResponse {
            granted,
            voter_id: self.config.node_id.clone(),
        }
    }

    /// Applies a leader announcement. A replica that believed itself
    /// leader steps down when another node announces.
    pub fn handle_announcement(&self, ann: &LeaderAnnouncement) {
        if ann.cluster_id != self.config.cluster_id {
            warn!(cluster = %ann.cluster_id, "announcement from foreign cluster ignored");
            return;
        }

        if ann.leader_id == self.config.node_id {
            return;
        }

        if self.is_leader.swap(false, Ordering::SeqCst) {
            info!(leader = %ann.leader_id, term = ann.term, "stepping down");
        }
        self.term.store(ann.term, Ordering::SeqCst);

        let mut inner = self.inner.write().unwrap();
        inner.leader_id = Some(ann.leader_id.clone());
        for peer in inner.peers.values_mut() {
            peer.claims_leader = peer.node_id.as_deref() == Some(ann.leader_id.as_str());
        }
    }

    pub fn become_leader(&self, term: i64) {
        self.term.store(term, Ordering::SeqCst);
        self.is_leader.store(true, Ordering::SeqCst);

        let mut inner = self.inner.write().unwrap();
        inner.leader_id = Some(self.config.node_id.clone());
        for peer in inner.peers.values_mut() {
            peer.claims_leader = false;
        }

        info!(node = %self.config.node_id, term, "became leader");
    }

    /// Election terms are wall-clock stamps; safety rests on quorum, not
    /// term monotonicity.
    pub fn next_term() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Deterministic per-replica delay before the first election, so
    /// simultaneous startups do not all campaign at once.
    pub fn initial_delay(&self) -> Duration {
        let mut hasher = DefaultHasher::new();
        self.config.node_id.hash(&mut hasher);
        let spread = self.config.election_timeout.as_millis().max(1) as u64;
        Duration::from_millis(hasher.finish() % spread)
    }
}

// ----------------------------------------------------------------------
// Background tasks
// ----------------------------------------------------------------------

fn probe_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()
}

/// Probes every peer's health endpoint each heartbeat interval.
pub async fn run_heartbeat_loop(
    cluster: Arc<Cluster>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client = probe_client()?;
    let mut tick = tokio::time::interval(cluster.config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return Ok(()),
        }

        for url in &cluster.config.peers {
            let probe = match client.get(format!("{}/ha/health", url)).send().await {
                Ok(resp) if resp.status().is_success() => {
                    resp.json::<HealthProbe>().await.ok()
                }
                _ => None,
            };
            cluster.observe_probe(url, probe, Utc::now());
        }
    }
}

/// Starts an election whenever the cluster looks leaderless, after a
/// per-replica randomized initial delay.
pub async fn run_election_loop(
    cluster: Arc<Cluster>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client = probe_client()?;

    tokio::select! {
        _ = tokio::time::sleep(cluster.initial_delay()) => {}
        _ = shutdown.changed() => return Ok(()),
    }

    let mut tick = tokio::time::interval(cluster.config.election_timeout);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return Ok(()),
        }

        let now = Utc::now();
        if !cluster.leaderless(now) {
            continue;
        }

        let term = Cluster::next_term();
        let request = VoteRequest {
            candidate_id: cluster.config.node_id.clone(),
            cluster_id: cluster.config.cluster_id.clone(),
            term,
        };
        info!(term, "cluster is leaderless, starting election");

        let mut grants = 0;
        for peer in cluster.healthy_peers(now) {
            let granted = match client
                .post(format!("{}/ha/election", peer.url))
                .json(&request)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => resp
                    .json::<VoteResponse>()
                    .await
                    .map(|v| v.granted)
                    .unwrap_or(false),
                _ => false,
            };
            if granted {
                grants += 1;
            }
        }

        if cluster.tally(grants) {
            cluster.become_leader(term);
        } else {
            info!(
                grants,
                quorum = cluster.quorum(),
                "election failed, will retry"
            );
        }
    }
}

/// While leader, announces leadership to every peer each heartbeat
/// interval.
pub async fn run_announce_loop(
    cluster: Arc<Cluster>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let client = probe_client()?;
    let mut tick = tokio::time::interval(cluster.config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return Ok(()),
        }

        if !cluster.is_leader() {
            continue;
        }

        let ann = LeaderAnnouncement {
            leader_id: cluster.config.node_id.clone(),
            cluster_id: cluster.config.cluster_id.clone(),
            term: cluster.current_term(),
        };

        for url in &cluster.config.peers {
            if let Err(err) = client
                .post(format!("{}/ha/leader", url))
                .json(&ann)
                .send()
                .await
            {
                warn!(peer = %url, "leader announcement failed: {err}");
            }
        }
    }
}
