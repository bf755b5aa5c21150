//! Cluster Membership
//!
//! The authoritative, versioned set of cluster peer addresses and the cached
//! view of each peer's health and last-known role. The set is mutated only by
//! leader-approved add/remove operations (or by adopting a newer version
//! propagated through heartbeats), never by failure detection: a dead peer
//! stays listed until an operator removes it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::network::protocol::{BinlogPosition, MemberEntry, PeerStatus};
use crate::state::store::MetaStore;
use crate::error::{Error, Result};

/// Role of a node in the cluster.
///
/// Closed set; every transition goes through [`Role::can_transition`] so an
/// unmodeled transition is rejected rather than silently applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Initial, unconfigured state
    Unknown,
    /// Administrative role: never campaigns, never votes for itself, still
    /// answers heartbeats and status
    Idle,
    /// Following a leader
    Follower,
    /// Running for election (transient)
    Candidate,
    /// Won the election for the current term
    Leader,
}

impl Role {
    /// Exhaustive transition table
    pub fn can_transition(self, to: Role) -> bool {
        use Role::*;
        match (self, to) {
            // Entering service
            (Unknown, Follower) => true,
            // Administrative demotion is allowed from anywhere, and staged
            // nodes are activated explicitly
            (_, Idle) => true,
            (Idle, Follower) => true,
            // Election flow
            (Follower, Candidate) => true,
            (Candidate, Leader) => true,
            (Candidate, Follower) => true,
            (Leader, Follower) => true,
            _ => false,
        }
    }

    pub fn is_leader(self) -> bool {
        self == Role::Leader
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Unknown => write!(f, "UNKNOWN"),
            Role::Idle => write!(f, "IDLE"),
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Leader => write!(f, "LEADER"),
        }
    }
}

/// Cached view of a peer. Never authoritative for the peer's own role.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address (also its identity)
    pub address: String,
    /// Last-known role
    pub role: Role,
    /// Whether this peer counts toward quorum
    pub voting: bool,
    /// Consecutive failed contacts
    pub failures: u32,
    /// Degraded to suspected-down after repeated unreachability
    pub suspected: bool,
    /// Last successful contact
    pub last_contact: Option<Instant>,
    /// Last replication position the peer reported
    pub position: Option<BinlogPosition>,
    /// When the peer entered the configuration
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl Peer {
    fn new(address: String, voting: bool) -> Self {
        Self {
            address,
            role: Role::Unknown,
            voting,
            failures: 0,
            suspected: false,
            last_contact: None,
            position: None,
            joined_at: chrono::Utc::now(),
        }
    }
}

/// Versioned cluster configuration snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub version: u64,
    /// Ordered member addresses, including this node
    pub members: Vec<String>,
}

struct MembershipInner {
    version: u64,
    /// Peers keyed by address; excludes self. BTreeMap keeps the member set
    /// ordered so configuration snapshots are stable.
    peers: BTreeMap<String, Peer>,
}

/// Membership registry
pub struct Membership {
    self_address: String,
    suspect_threshold: u32,
    store: Arc<MetaStore>,
    inner: RwLock<MembershipInner>,
}

impl Membership {
    pub fn new(self_address: String, suspect_threshold: u32, store: Arc<MetaStore>) -> Self {
        Self {
            self_address,
            suspect_threshold,
            store,
            inner: RwLock::new(MembershipInner {
                version: 0,
                peers: BTreeMap::new(),
            }),
        }
    }

    /// This node's address
    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Load the persisted configuration, or seed it from the configured peer
    /// list on first start. Existing members are voting; probation applies
    /// only to nodes added at runtime.
    pub async fn bootstrap(&self, seed_peers: &[String]) -> Result<()> {
        let persisted = self.store.configuration().await?;

        let mut inner = self.inner.write().await;
        match persisted {
            Some((version, members)) => {
                inner.version = version;
                for address in members {
                    if address != self.self_address {
                        inner
                            .peers
                            .insert(address.clone(), Peer::new(address, true));
                    }
                }
                tracing::info!(
                    "Loaded configuration version {} with {} members",
                    inner.version,
                    inner.peers.len() + 1
                );
            }
            None => {
                for address in seed_peers {
                    if *address != self.self_address {
                        inner
                            .peers
                            .insert(address.clone(), Peer::new(address.clone(), true));
                    }
                }
                inner.version = 1;
                let members = Self::member_list(&self.self_address, &inner.peers);
                self.store
                    .save_configuration(inner.version, &members)
                    .await?;
                tracing::info!(
                    "Seeded configuration version 1 with {} members",
                    inner.peers.len() + 1
                );
            }
        }
        Ok(())
    }

    fn member_list(self_address: &str, peers: &BTreeMap<String, Peer>) -> Vec<String> {
        let mut members: Vec<String> = peers.keys().cloned().collect();
        members.push(self_address.to_string());
        members.sort();
        members
    }

    /// Current configuration version
    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    /// Snapshot of the current configuration
    pub async fn configuration(&self) -> ClusterConfiguration {
        let inner = self.inner.read().await;
        ClusterConfiguration {
            version: inner.version,
            members: Self::member_list(&self.self_address, &inner.peers),
        }
    }

    /// Member entries for heartbeat propagation
    pub async fn member_entries(&self) -> Vec<MemberEntry> {
        let inner = self.inner.read().await;
        let mut entries = vec![MemberEntry {
            address: self.self_address.clone(),
            voting: true,
        }];
        for peer in inner.peers.values() {
            entries.push(MemberEntry {
                address: peer.address.clone(),
                voting: peer.voting,
            });
        }
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }

    /// Add nodes to the configuration. New nodes start non-voting until they
    /// demonstrate health, so a flaky addition cannot destabilize an existing
    /// majority. Increments and persists the configuration version.
    pub async fn add_nodes(&self, addresses: &[String]) -> Result<u64> {
        if addresses.is_empty() {
            return Err(Error::State("AddNode requires at least one address".into()));
        }

        let mut inner = self.inner.write().await;
        for address in addresses {
            if address.is_empty() {
                return Err(Error::State("AddNode received an empty address".into()));
            }
            if *address == self.self_address || inner.peers.contains_key(address) {
                continue;
            }
            inner
                .peers
                .insert(address.clone(), Peer::new(address.clone(), false));
            tracing::info!("Added node {} (non-voting until healthy)", address);
        }

        inner.version += 1;
        let members = Self::member_list(&self.self_address, &inner.peers);
        self.store
            .save_configuration(inner.version, &members)
            .await?;
        Ok(inner.version)
    }

    /// Remove nodes from the configuration. Increments and persists the
    /// configuration version; fails with NodeNotFound when no listed address
    /// is a member.
    pub async fn remove_nodes(&self, addresses: &[String]) -> Result<u64> {
        if addresses.is_empty() {
            return Err(Error::State(
                "RemoveNode requires at least one address".into(),
            ));
        }
        if addresses.iter().any(|a| *a == self.self_address) {
            return Err(Error::State("A node cannot remove itself".into()));
        }

        let mut inner = self.inner.write().await;
        let mut removed = false;
        for address in addresses {
            if inner.peers.remove(address).is_some() {
                tracing::info!("Removed node {}", address);
                removed = true;
            }
        }
        if !removed {
            return Err(Error::NodeNotFound(addresses.join(", ")));
        }

        inner.version += 1;
        let members = Self::member_list(&self.self_address, &inner.peers);
        self.store
            .save_configuration(inner.version, &members)
            .await?;
        Ok(inner.version)
    }

    /// Adopt a configuration propagated by the leader. Strictly newer
    /// versions only; existing peer health state is preserved for retained
    /// addresses.
    pub async fn apply_remote(&self, version: u64, members: &[MemberEntry]) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if version <= inner.version {
            return Ok(false);
        }

        let mut peers = BTreeMap::new();
        for entry in members {
            if entry.address == self.self_address {
                continue;
            }
            let peer = match inner.peers.remove(&entry.address) {
                Some(mut existing) => {
                    existing.voting = entry.voting;
                    existing
                }
                None => Peer::new(entry.address.clone(), entry.voting),
            };
            peers.insert(entry.address.clone(), peer);
        }

        inner.peers = peers;
        inner.version = version;
        let member_list = Self::member_list(&self.self_address, &inner.peers);
        self.store.save_configuration(version, &member_list).await?;

        tracing::info!(
            "Adopted configuration version {} with {} members",
            version,
            member_list.len()
        );
        Ok(true)
    }

    /// Record a successful contact with a peer. The role is updated only
    /// when the exchange actually revealed one.
    pub async fn record_contact(
        &self,
        address: &str,
        role: Option<Role>,
        position: Option<BinlogPosition>,
    ) {
        let mut inner = self.inner.write().await;
        if let Some(peer) = inner.peers.get_mut(address) {
            if let Some(role) = role {
                peer.role = role;
            }
            peer.failures = 0;
            peer.suspected = false;
            peer.last_contact = Some(Instant::now());
            if position.is_some() {
                peer.position = position;
            }
        }
    }

    /// Record a failed contact; past the threshold the peer is suspected
    /// down, observable via status but never auto-removed.
    pub async fn record_failure(&self, address: &str) {
        let mut inner = self.inner.write().await;
        if let Some(peer) = inner.peers.get_mut(address) {
            peer.failures = peer.failures.saturating_add(1);
            if peer.failures >= self.suspect_threshold && !peer.suspected {
                peer.suspected = true;
                tracing::warn!(
                    "Peer {} suspected down after {} failed contacts",
                    address,
                    peer.failures
                );
            }
        }
    }

    /// Promote a probationary node to voting once it has demonstrated health
    pub async fn promote_voting(&self, address: &str) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(peer) = inner.peers.get_mut(address) {
            if !peer.voting {
                peer.voting = true;
                tracing::info!("Node {} promoted to voting member", address);
                return true;
            }
        }
        false
    }

    /// Whether the address is part of the configuration (self included)
    pub async fn contains(&self, address: &str) -> bool {
        if address == self.self_address {
            return true;
        }
        self.inner.read().await.peers.contains_key(address)
    }

    /// Voting members, self included
    pub async fn voting_members(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut members = vec![self.self_address.clone()];
        members.extend(
            inner
                .peers
                .values()
                .filter(|p| p.voting)
                .map(|p| p.address.clone()),
        );
        members.sort();
        members
    }

    /// Strict majority of the voting configuration
    pub async fn majority(&self) -> usize {
        self.voting_members().await.len() / 2 + 1
    }

    /// Snapshot of all peers (excluding self)
    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.read().await.peers.values().cloned().collect()
    }

    /// Peer addresses (excluding self)
    pub async fn peer_addresses(&self) -> Vec<String> {
        self.inner.read().await.peers.keys().cloned().collect()
    }

    /// Replication positions of healthy followers, for the purge cursor
    pub async fn healthy_follower_positions(&self) -> Vec<Option<BinlogPosition>> {
        let inner = self.inner.read().await;
        inner
            .peers
            .values()
            .filter(|p| !p.suspected)
            .map(|p| p.position.clone())
            .collect()
    }

    /// Per-peer detail for status reporting
    pub async fn peer_statuses(&self) -> Vec<PeerStatus> {
        let inner = self.inner.read().await;
        inner
            .peers
            .values()
            .map(|p| PeerStatus {
                address: p.address.clone(),
                role: p.role,
                voting: p.voting,
                suspected: p.suspected,
                last_contact_ms: p.last_contact.map(|t| t.elapsed().as_millis() as u64),
                joined_at: p.joined_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn membership(dir: &std::path::Path) -> Membership {
        let store = Arc::new(MetaStore::open(dir.to_path_buf()).unwrap());
        let m = Membership::new("10.0.0.1:7650".to_string(), 3, store);
        m.bootstrap(&["10.0.0.2:7650".to_string(), "10.0.0.3:7650".to_string()])
            .await
            .unwrap();
        m
    }

    #[test]
    fn test_transition_table() {
        use Role::*;
        assert!(Unknown.can_transition(Follower));
        assert!(Unknown.can_transition(Idle));
        assert!(Follower.can_transition(Candidate));
        assert!(Candidate.can_transition(Leader));
        assert!(Candidate.can_transition(Follower));
        assert!(Leader.can_transition(Follower));
        assert!(Leader.can_transition(Idle));
        assert!(Idle.can_transition(Follower));

        // Unmodeled transitions are rejected
        assert!(!Follower.can_transition(Leader));
        assert!(!Idle.can_transition(Candidate));
        assert!(!Idle.can_transition(Leader));
        assert!(!Leader.can_transition(Candidate));
        assert!(!Unknown.can_transition(Leader));
        assert!(!Unknown.can_transition(Candidate));
    }

    #[tokio::test]
    async fn test_bootstrap_and_quorum() {
        let dir = tempdir().unwrap();
        let m = membership(dir.path()).await;

        assert_eq!(m.version().await, 1);
        assert_eq!(m.voting_members().await.len(), 3);
        assert_eq!(m.majority().await, 2);
    }

    #[tokio::test]
    async fn test_add_starts_non_voting() {
        let dir = tempdir().unwrap();
        let m = membership(dir.path()).await;

        let version = m.add_nodes(&["10.0.0.4:7650".to_string()]).await.unwrap();
        assert_eq!(version, 2);

        // Probationary node is listed but does not count toward quorum
        assert_eq!(m.peers().await.len(), 3);
        assert_eq!(m.voting_members().await.len(), 3);
        assert_eq!(m.majority().await, 2);

        assert!(m.promote_voting("10.0.0.4:7650").await);
        assert_eq!(m.voting_members().await.len(), 4);
        assert_eq!(m.majority().await, 3);
    }

    #[tokio::test]
    async fn test_remove_unknown_node_is_an_error() {
        let dir = tempdir().unwrap();
        let m = membership(dir.path()).await;

        let err = m
            .remove_nodes(&["10.0.0.9:7650".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
        assert_eq!(m.version().await, 1);
    }

    #[tokio::test]
    async fn test_remove_increments_version() {
        let dir = tempdir().unwrap();
        let m = membership(dir.path()).await;

        let version = m
            .remove_nodes(&["10.0.0.3:7650".to_string()])
            .await
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(m.voting_members().await.len(), 2);
        assert!(!m.contains("10.0.0.3:7650").await);
    }

    #[tokio::test]
    async fn test_configuration_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let m = membership(dir.path()).await;
            m.add_nodes(&["10.0.0.4:7650".to_string()]).await.unwrap();
        }

        let store = Arc::new(MetaStore::open(dir.path().to_path_buf()).unwrap());
        let m = Membership::new("10.0.0.1:7650".to_string(), 3, store);
        m.bootstrap(&[]).await.unwrap();

        assert_eq!(m.version().await, 2);
        assert!(m.contains("10.0.0.4:7650").await);
    }

    #[tokio::test]
    async fn test_suspected_after_repeated_failures() {
        let dir = tempdir().unwrap();
        let m = membership(dir.path()).await;

        for _ in 0..2 {
            m.record_failure("10.0.0.2:7650").await;
        }
        assert!(!m.peer_statuses().await.iter().any(|p| p.suspected));

        m.record_failure("10.0.0.2:7650").await;
        let statuses = m.peer_statuses().await;
        let peer = statuses
            .iter()
            .find(|p| p.address == "10.0.0.2:7650")
            .unwrap();
        assert!(peer.suspected);

        // Still a member: suspicion never removes a node
        assert!(m.contains("10.0.0.2:7650").await);

        m.record_contact("10.0.0.2:7650", Some(Role::Follower), None).await;
        let statuses = m.peer_statuses().await;
        let peer = statuses
            .iter()
            .find(|p| p.address == "10.0.0.2:7650")
            .unwrap();
        assert!(!peer.suspected);
    }

    #[tokio::test]
    async fn test_apply_remote_only_newer() {
        let dir = tempdir().unwrap();
        let m = membership(dir.path()).await;

        let stale = vec![MemberEntry {
            address: "10.0.0.9:7650".to_string(),
            voting: true,
        }];
        assert!(!m.apply_remote(1, &stale).await.unwrap());
        assert!(!m.contains("10.0.0.9:7650").await);

        let newer = vec![
            MemberEntry {
                address: "10.0.0.1:7650".to_string(),
                voting: true,
            },
            MemberEntry {
                address: "10.0.0.2:7650".to_string(),
                voting: true,
            },
            MemberEntry {
                address: "10.0.0.9:7650".to_string(),
                voting: false,
            },
        ];
        assert!(m.apply_remote(5, &newer).await.unwrap());
        assert_eq!(m.version().await, 5);
        assert!(m.contains("10.0.0.9:7650").await);
        assert!(!m.contains("10.0.0.3:7650").await);
    }
}
