//! Election State Machine
//!
//! The authoritative role/term tracker. All shared mutable state (role,
//! term, granted vote, known leader, health flags) lives in one owned
//! container behind a single lock; every loop and RPC handler reads and
//! mutates through it, so a concurrent vote grant and a heartbeat-triggered
//! step-down can never interleave into a lost update.
//!
//! Role-transition side effects are not executed here: confirmed transitions
//! are emitted as events on an unbounded channel whose single consumer (the
//! replication controller) serializes them per node.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Notify, RwLock};

use crate::network::protocol::{BinlogPosition, MemberEntry, Message};
use crate::network::RpcClient;
use crate::state::membership::{Membership, Role};
use crate::state::store::MetaStore;
use crate::timer::{fixed_ticker, ElectionTimer};
use crate::error::{Error, Result};

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// Base election timeout; deadlines are drawn from [t, 2t)
    pub election_timeout: Duration,
    /// Leader heartbeat period
    pub heartbeat_timeout: Duration,
    /// Start in the administrative IDLE role
    pub start_as_idle: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(3000),
            heartbeat_timeout: Duration::from_millis(1000),
            start_as_idle: false,
        }
    }
}

/// A confirmed role transition with leadership side effects.
///
/// Emitted exactly once per transition event, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTransition {
    /// The node became leader for `term`
    Acquire { term: u64 },
    /// The node lost leadership it held in `term`
    Release { term: u64 },
}

/// Node-local status snapshot
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub address: String,
    pub role: Role,
    pub term: u64,
    pub leader: Option<String>,
    pub degraded: bool,
    pub replication_inconsistent: bool,
}

struct ElectionInner {
    role: Role,
    term: u64,
    /// Last granted vote: (term, candidate address)
    voted_for: Option<(u64, String)>,
    leader: Option<String>,
    /// Grants collected while campaigning
    votes_received: HashSet<String>,
    timer: ElectionTimer,
    /// This node's replication position marker
    position: Option<BinlogPosition>,
    /// Health probe verdict; a degraded node must not campaign
    degraded: bool,
    /// Leader-start failed: leader at the consensus layer, inconsistent at
    /// the replication layer
    replication_inconsistent: bool,
    /// Persistence failed: voting and leadership participation stopped
    halted: bool,
}

/// The election state machine
pub struct ElectionMachine {
    address: String,
    config: ElectionConfig,
    membership: Arc<Membership>,
    store: Arc<MetaStore>,
    client: RpcClient,
    transitions: mpsc::UnboundedSender<RoleTransition>,
    heartbeat_now: Notify,
    role_changed: Notify,
    inner: RwLock<ElectionInner>,
}

impl ElectionMachine {
    pub fn new(
        address: String,
        config: ElectionConfig,
        membership: Arc<Membership>,
        store: Arc<MetaStore>,
        client: RpcClient,
        transitions: mpsc::UnboundedSender<RoleTransition>,
    ) -> Self {
        let timer = ElectionTimer::new(config.election_timeout);
        Self {
            address,
            config,
            membership,
            store,
            client,
            transitions,
            heartbeat_now: Notify::new(),
            role_changed: Notify::new(),
            inner: RwLock::new(ElectionInner {
                role: Role::Unknown,
                term: 0,
                voted_for: None,
                leader: None,
                votes_received: HashSet::new(),
                timer,
                position: None,
                degraded: false,
                replication_inconsistent: false,
                halted: false,
            }),
        }
    }

    /// This node's address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Reload persisted term/vote and enter service
    pub async fn start(&self) -> Result<()> {
        let term = self.store.current_term().await?;
        let vote = self.store.vote().await?;

        let mut inner = self.inner.write().await;
        inner.term = term;
        inner.voted_for = vote;

        let initial = if self.config.start_as_idle {
            Role::Idle
        } else {
            Role::Follower
        };
        self.transition_locked(&mut inner, initial)?;
        inner.timer.reset();

        tracing::info!(
            "Election machine started as {} at term {}",
            initial,
            inner.term
        );
        Ok(())
    }

    // ========== Accessors ==========

    pub async fn role(&self) -> Role {
        self.inner.read().await.role
    }

    pub async fn term(&self) -> u64 {
        self.inner.read().await.term
    }

    pub async fn leader(&self) -> Option<String> {
        self.inner.read().await.leader.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.read().await.role.is_leader()
    }

    pub async fn is_halted(&self) -> bool {
        self.inner.read().await.halted
    }

    pub async fn is_degraded(&self) -> bool {
        self.inner.read().await.degraded
    }

    pub async fn position(&self) -> Option<BinlogPosition> {
        self.inner.read().await.position.clone()
    }

    pub async fn status(&self) -> NodeStatus {
        let inner = self.inner.read().await;
        NodeStatus {
            address: self.address.clone(),
            role: inner.role,
            term: inner.term,
            leader: inner.leader.clone(),
            degraded: inner.degraded,
            replication_inconsistent: inner.replication_inconsistent,
        }
    }

    /// Whether an election is currently in flight for this term: this node
    /// is campaigning, or it granted a vote and has not yet learned the
    /// outcome. Reconfiguration is rejected with Busy in either case.
    pub async fn election_in_flight(&self) -> bool {
        let inner = self.inner.read().await;
        match inner.role {
            Role::Candidate => true,
            Role::Leader => false,
            _ => {
                inner.leader.is_none()
                    && inner
                        .voted_for
                        .as_ref()
                        .map(|(t, _)| *t == inner.term && inner.term > 0)
                        .unwrap_or(false)
            }
        }
    }

    // ========== Flags maintained by the replication controller ==========

    pub async fn set_position(&self, position: Option<BinlogPosition>) {
        self.inner.write().await.position = position;
    }

    pub async fn set_degraded(&self, degraded: bool) {
        let mut inner = self.inner.write().await;
        if inner.degraded != degraded {
            if degraded {
                tracing::warn!("Node degraded: MySQL probe failing, campaigns disabled");
            } else {
                tracing::info!("Node recovered: MySQL probe healthy again");
            }
            inner.degraded = degraded;
        }
    }

    pub async fn set_replication_inconsistent(&self, inconsistent: bool) {
        self.inner.write().await.replication_inconsistent = inconsistent;
    }

    /// Halt voting and leadership participation after a persistence failure
    pub async fn halt(&self, reason: &str) {
        let mut inner = self.inner.write().await;
        if !inner.halted {
            tracing::error!("Halting election participation: {}", reason);
            inner.halted = true;
        }
    }

    // ========== Administrative transitions ==========

    /// Demote to the administrative IDLE role. The only path into IDLE.
    pub async fn set_idle(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.role == Role::Idle {
            return Ok(());
        }
        self.transition_locked(&mut inner, Role::Idle)?;
        inner.leader = None;
        inner.votes_received.clear();
        tracing::info!("Administratively set to IDLE");
        Ok(())
    }

    /// Activate a staged IDLE node into FOLLOWER
    pub async fn activate(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.role == Role::Follower {
            return Ok(());
        }
        self.transition_locked(&mut inner, Role::Follower)?;
        inner.timer.reset();
        tracing::info!("Administratively activated to FOLLOWER");
        Ok(())
    }

    // ========== Election timer loop ==========

    /// Drive election timeouts until shutdown.
    ///
    /// Only FOLLOWER and CANDIDATE arm a wake on the election deadline; a
    /// LEADER, IDLE, or UNKNOWN node parks on the next role change instead,
    /// so a lapsed deadline never turns into a busy loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (campaigns, remaining) = {
                let inner = self.inner.read().await;
                (
                    matches!(inner.role, Role::Follower | Role::Candidate),
                    inner.timer.remaining(),
                )
            };

            if !campaigns {
                tokio::select! {
                    _ = self.role_changed.notified() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
                continue;
            }

            // Wake shortly after the deadline; a heartbeat may re-arm it
            let sleep = remaining + Duration::from_millis(5);

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {
                    if let Err(e) = self.maybe_campaign().await {
                        if e.is_fatal() {
                            self.halt(&e.to_string()).await;
                        } else {
                            tracing::warn!("Election round failed: {}", e);
                        }
                    }
                }
                _ = self.role_changed.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Election timer loop stopped");
    }

    /// Campaign if the election timeout has expired and this node is
    /// eligible: a healthy, non-halted FOLLOWER (or a CANDIDATE whose
    /// attempt went nowhere). IDLE and UNKNOWN never campaign; a degraded
    /// or halted node sits the attempt out for a fresh timeout draw.
    pub(crate) async fn maybe_campaign(&self) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            if !inner.timer.expired() {
                return Ok(());
            }
            if !matches!(inner.role, Role::Follower | Role::Candidate) {
                return Ok(());
            }
            if inner.degraded || inner.halted {
                inner.timer.reset();
                return Ok(());
            }
        }
        self.election_round().await
    }

    /// Run one election attempt: increment the term, vote for self, fan a
    /// single VoteRequest to every configured peer, and count grants.
    async fn election_round(&self) -> Result<()> {
        let (term, position) = {
            let mut inner = self.inner.write().await;

            // Re-check eligibility: a heartbeat may have landed since
            if !inner.timer.expired()
                || !matches!(inner.role, Role::Follower | Role::Candidate)
                || inner.degraded
                || inner.halted
            {
                return Ok(());
            }

            let new_term = inner.term + 1;

            // Durability before participation: a crash after this point must
            // restart into the new term with the self-vote recorded.
            self.store.set_current_term(new_term).await?;
            self.store.save_vote(new_term, &self.address).await?;

            inner.term = new_term;
            if inner.role == Role::Follower {
                self.transition_locked(&mut inner, Role::Candidate)?;
            }
            inner.voted_for = Some((new_term, self.address.clone()));
            inner.leader = None;
            inner.votes_received.clear();
            inner.votes_received.insert(self.address.clone());
            inner.timer.reset();

            tracing::info!("Starting election for term {}", new_term);

            let position = inner
                .position
                .clone()
                .unwrap_or_else(|| BinlogPosition::new("", 0));
            (new_term, position)
        };

        // One request per peer per attempt, outside the lock; an unreachable
        // peer is simply absent from this round.
        let peer_addresses = self.membership.peer_addresses().await;
        let requests = peer_addresses.iter().map(|address| {
            let message = Message::VoteRequest {
                term,
                candidate: self.address.clone(),
                position: position.clone(),
            };
            async move { (address.clone(), self.client.send(address, message).await) }
        });

        for (address, result) in join_all(requests).await {
            match result {
                Ok(Message::VoteResponse {
                    term: response_term,
                    voter,
                    granted,
                }) => {
                    self.handle_vote_response(&voter, response_term, granted)
                        .await?;
                    self.membership.record_contact(&address, None, None).await;
                }
                Ok(other) => {
                    tracing::debug!(
                        "Unexpected {} from {} during election",
                        other.type_name(),
                        address
                    );
                }
                Err(e) if e.is_unreachable() => {
                    self.membership.record_failure(&address).await;
                }
                Err(e) => {
                    tracing::warn!("Vote request to {} failed: {}", address, e);
                    self.membership.record_failure(&address).await;
                }
            }
        }

        // The self-vote alone wins a single-node configuration
        self.check_election_result().await
    }

    /// Apply a vote response while campaigning
    pub async fn handle_vote_response(
        &self,
        voter: &str,
        term: u64,
        granted: bool,
    ) -> Result<()> {
        let voting = self.membership.voting_members().await;

        let mut inner = self.inner.write().await;
        if inner.role != Role::Candidate {
            return Ok(());
        }
        if term > inner.term {
            return self.step_down_locked(&mut inner, term, None).await;
        }
        if term != inner.term {
            return Ok(());
        }

        if granted && voting.iter().any(|m| m == voter) {
            if inner.votes_received.insert(voter.to_string()) {
                tracing::info!(
                    "Vote granted by {} ({}/{})",
                    voter,
                    inner.votes_received.len(),
                    voting.len() / 2 + 1
                );
            }
        }
        drop(inner);

        self.check_election_result().await
    }

    /// Promote to leader once a strict majority of the voting configuration
    /// has granted the candidate's term
    async fn check_election_result(&self) -> Result<()> {
        let majority = self.membership.majority().await;

        let mut inner = self.inner.write().await;
        if inner.role != Role::Candidate {
            return Ok(());
        }
        if inner.votes_received.len() >= majority {
            let term = inner.term;
            self.transition_locked(&mut inner, Role::Leader)?;
            inner.leader = Some(self.address.clone());
            tracing::info!("Won election for term {}, becoming LEADER", term);
            self.heartbeat_now.notify_one();
        }
        Ok(())
    }

    // ========== Inbound RPC handling ==========

    /// Handle a VoteRequest. The single-grant invariant is enforced here:
    /// the grant is persisted before the response leaves the node.
    pub async fn handle_vote_request(
        &self,
        term: u64,
        candidate: &str,
        position: &BinlogPosition,
    ) -> Message {
        let mut inner = self.inner.write().await;

        let deny = |inner: &ElectionInner| Message::VoteResponse {
            term: inner.term,
            voter: self.address.clone(),
            granted: false,
        };

        if inner.halted || inner.role == Role::Unknown {
            return deny(&inner);
        }

        if term < inner.term {
            tracing::debug!(
                "Denying vote for {}: stale term {} < {}",
                candidate,
                term,
                inner.term
            );
            return deny(&inner);
        }

        if term > inner.term {
            if let Err(e) = self.step_down_locked(&mut inner, term, None).await {
                if e.is_fatal() {
                    inner.halted = true;
                    tracing::error!("Halting election participation: {}", e);
                }
                return deny(&inner);
            }
        }

        // Identical-position tie-break between concurrent candidates: the
        // lexicographically smaller address wins the head-to-head; the
        // larger one abandons its candidacy for this term.
        let own_position = inner
            .position
            .clone()
            .unwrap_or_else(|| BinlogPosition::new("", 0));
        if inner.role == Role::Candidate
            && *position == own_position
            && candidate < self.address.as_str()
        {
            let _ = self.transition_locked(&mut inner, Role::Follower);
            inner.votes_received.clear();
            inner.timer.reset();
            tracing::info!(
                "Yielding candidacy for term {} to {} (position tie)",
                inner.term,
                candidate
            );
            return deny(&inner);
        }

        let already_voted = match &inner.voted_for {
            Some((voted_term, voted_candidate)) => {
                *voted_term == inner.term && voted_candidate != candidate
            }
            None => false,
        };

        // A stale-data candidate must never win leadership
        let position_ok = *position >= own_position;

        if already_voted || !position_ok {
            return deny(&inner);
        }

        // Durability before the response: a crash-then-restart must not
        // grant a second vote in this term.
        if let Err(e) = self.store.save_vote(inner.term, candidate).await {
            inner.halted = true;
            tracing::error!("Halting election participation: {}", e);
            return deny(&inner);
        }

        inner.voted_for = Some((inner.term, candidate.to_string()));
        inner.timer.reset();

        tracing::info!("Granting vote to {} for term {}", candidate, inner.term);

        Message::VoteResponse {
            term: inner.term,
            voter: self.address.clone(),
            granted: true,
        }
    }

    /// Handle a leader heartbeat. Also the membership propagation path:
    /// strictly newer configurations carried in the payload are adopted.
    pub async fn handle_heartbeat(
        &self,
        term: u64,
        leader: &str,
        position: Option<BinlogPosition>,
        config_version: u64,
        members: &[MemberEntry],
    ) -> Message {
        {
            let mut inner = self.inner.write().await;

            if term < inner.term {
                return Message::HeartbeatResponse {
                    term: inner.term,
                    node: self.address.clone(),
                    success: false,
                    position: inner.position.clone(),
                };
            }

            let step_down_needed = term > inner.term
                || (matches!(inner.role, Role::Candidate | Role::Leader)
                    && leader != self.address);
            if step_down_needed {
                if let Err(e) = self.step_down_locked(&mut inner, term, Some(leader)).await {
                    if e.is_fatal() {
                        inner.halted = true;
                        tracing::error!("Halting election participation: {}", e);
                    }
                    return Message::HeartbeatResponse {
                        term: inner.term,
                        node: self.address.clone(),
                        success: false,
                        position: inner.position.clone(),
                    };
                }
            }

            inner.leader = Some(leader.to_string());
            inner.timer.reset();
        }

        self.membership
            .record_contact(leader, Some(Role::Leader), position)
            .await;
        if let Err(e) = self.membership.apply_remote(config_version, members).await {
            if e.is_fatal() {
                self.halt(&e.to_string()).await;
            } else {
                tracing::warn!("Failed to adopt configuration {}: {}", config_version, e);
            }
        }

        let inner = self.inner.read().await;
        Message::HeartbeatResponse {
            term: inner.term,
            node: self.address.clone(),
            success: true,
            position: inner.position.clone(),
        }
    }

    // ========== Leader heartbeat loop ==========

    /// Emit heartbeats to every peer once per heartbeat period while this
    /// node is leader. Also handles grant-of-health promotion for
    /// probationary members and step-down on higher-term responses.
    pub async fn run_heartbeats(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = fixed_ticker(self.config.heartbeat_timeout);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.heartbeat_now.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            if !self.is_leader().await {
                continue;
            }
            if let Err(e) = self.heartbeat_round().await {
                match e {
                    Error::StaleTerm { .. } => {
                        tracing::info!("Heartbeat round rejected: {}", e)
                    }
                    _ => tracing::warn!("Heartbeat round failed: {}", e),
                }
            }
        }
        tracing::debug!("Heartbeat loop stopped");
    }

    /// Request an immediate heartbeat round (after a membership change)
    pub fn trigger_heartbeat(&self) {
        self.heartbeat_now.notify_one();
    }

    async fn heartbeat_round(&self) -> Result<()> {
        let (term, position) = {
            let inner = self.inner.read().await;
            if inner.role != Role::Leader {
                return Ok(());
            }
            (inner.term, inner.position.clone())
        };
        let configuration = self.membership.configuration().await;
        let members = self.membership.member_entries().await;
        let peers = self.membership.peers().await;

        let requests = peers.iter().map(|peer| {
            let message = Message::Heartbeat {
                term,
                leader: self.address.clone(),
                position: position.clone(),
                config_version: configuration.version,
                members: members.clone(),
            };
            async move { (peer.clone(), self.client.send(&peer.address, message).await) }
        });

        for (peer, result) in join_all(requests).await {
            match result {
                Ok(Message::HeartbeatResponse {
                    term: response_term,
                    node,
                    success,
                    position: follower_position,
                }) => {
                    if response_term > term {
                        let mut inner = self.inner.write().await;
                        if response_term > inner.term {
                            if let Err(e) = self
                                .step_down_locked(&mut inner, response_term, None)
                                .await
                            {
                                if e.is_fatal() {
                                    inner.halted = true;
                                    tracing::error!(
                                        "Halting election participation: {}",
                                        e
                                    );
                                }
                            }
                        }
                        return Err(Error::StaleTerm {
                            got: term,
                            current: response_term,
                        });
                    }
                    if success {
                        self.membership
                            .record_contact(&node, Some(Role::Follower), follower_position)
                            .await;
                        // A probationary node has now demonstrated health
                        if !peer.voting {
                            self.membership.promote_voting(&node).await;
                        }
                    }
                }
                Ok(other) => {
                    tracing::debug!(
                        "Unexpected {} from {} during heartbeat",
                        other.type_name(),
                        peer.address
                    );
                }
                Err(e) if e.is_unreachable() => {
                    self.membership.record_failure(&peer.address).await;
                }
                Err(e) => {
                    tracing::warn!("Heartbeat to {} failed: {}", peer.address, e);
                    self.membership.record_failure(&peer.address).await;
                }
            }
        }

        Ok(())
    }

    // ========== Internal transitions ==========

    /// Adopt a new term and/or demote to follower. Persists the term bump
    /// before it takes effect, emits Release exactly once when leadership is
    /// lost, and re-arms the election timer.
    async fn step_down_locked(
        &self,
        inner: &mut ElectionInner,
        new_term: u64,
        new_leader: Option<&str>,
    ) -> Result<()> {
        if new_term > inner.term {
            self.store.set_current_term(new_term).await?;
            inner.term = new_term;
            inner.voted_for = None;
        }

        if matches!(inner.role, Role::Candidate | Role::Leader) {
            self.transition_locked(inner, Role::Follower)?;
        }

        inner.leader = new_leader.map(|l| l.to_string());
        inner.votes_received.clear();
        inner.timer.reset();

        tracing::info!("Stepped down to FOLLOWER at term {}", inner.term);
        Ok(())
    }

    /// The single place a role changes. Rejects unmodeled transitions and
    /// emits the leadership side-effect events.
    fn transition_locked(&self, inner: &mut ElectionInner, to: Role) -> Result<()> {
        let from = inner.role;
        if from == to {
            return Ok(());
        }
        if !from.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        inner.role = to;
        self.role_changed.notify_one();

        if to == Role::Leader {
            let _ = self
                .transitions
                .send(RoleTransition::Acquire { term: inner.term });
        } else if from == Role::Leader {
            let _ = self
                .transitions
                .send(RoleTransition::Release { term: inner.term });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        machine: Arc<ElectionMachine>,
        membership: Arc<Membership>,
        store: Arc<MetaStore>,
        transitions: UnboundedReceiver<RoleTransition>,
        _dir: tempfile::TempDir,
    }

    async fn harness(peers: &[&str], start_as_idle: bool) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().to_path_buf()).unwrap());
        let membership = Arc::new(Membership::new(
            "10.0.0.5:7650".to_string(),
            3,
            Arc::clone(&store),
        ));
        let seed: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
        membership.bootstrap(&seed).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Arc::new(ElectionMachine::new(
            "10.0.0.5:7650".to_string(),
            ElectionConfig {
                election_timeout: Duration::from_millis(50),
                heartbeat_timeout: Duration::from_millis(20),
                start_as_idle,
            },
            Arc::clone(&membership),
            Arc::clone(&store),
            RpcClient::new(Duration::from_millis(50)),
            tx,
        ));
        machine.start().await.unwrap();

        Harness {
            machine,
            membership,
            store,
            transitions: rx,
            _dir: dir,
        }
    }

    fn position(file: &str, offset: u64) -> BinlogPosition {
        BinlogPosition::new(file, offset)
    }

    #[tokio::test]
    async fn test_starts_as_follower_with_persisted_term() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().to_path_buf()).unwrap());
        store.set_current_term(9).await.unwrap();

        let membership = Arc::new(Membership::new(
            "10.0.0.5:7650".to_string(),
            3,
            Arc::clone(&store),
        ));
        membership.bootstrap(&[]).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let machine = ElectionMachine::new(
            "10.0.0.5:7650".to_string(),
            ElectionConfig::default(),
            membership,
            store,
            RpcClient::new(Duration::from_millis(50)),
            tx,
        );
        machine.start().await.unwrap();

        assert_eq!(machine.role().await, Role::Follower);
        assert_eq!(machine.term().await, 9);
    }

    #[tokio::test]
    async fn test_idle_never_campaigns() {
        let mut h = harness(&[], true).await;
        assert_eq!(h.machine.role().await, Role::Idle);

        tokio::time::sleep(Duration::from_millis(150)).await;
        h.machine.maybe_campaign().await.unwrap();

        assert_eq!(h.machine.role().await, Role::Idle);
        assert!(h.transitions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_degraded_never_campaigns() {
        let h = harness(&[], false).await;
        h.machine.set_degraded(true).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        h.machine.maybe_campaign().await.unwrap();

        assert_eq!(h.machine.role().await, Role::Follower);

        // The lapsed deadline was re-armed while degraded: recovering does
        // not trigger an instant campaign off the stale expiry
        h.machine.set_degraded(false).await;
        h.machine.maybe_campaign().await.unwrap();
        assert_eq!(h.machine.role().await, Role::Follower);
    }

    #[tokio::test]
    async fn test_single_node_wins_instantly() {
        let mut h = harness(&[], false).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        h.machine.maybe_campaign().await.unwrap();

        assert_eq!(h.machine.role().await, Role::Leader);
        assert_eq!(h.machine.term().await, 1);
        assert_eq!(
            h.transitions.try_recv().unwrap(),
            RoleTransition::Acquire { term: 1 }
        );
        // Term and self-vote were persisted before the win
        assert_eq!(h.store.current_term().await.unwrap(), 1);
        assert_eq!(
            h.store.vote().await.unwrap(),
            Some((1, "10.0.0.5:7650".to_string()))
        );
    }

    #[tokio::test]
    async fn test_vote_granted_once_per_term() {
        let h = harness(&["10.0.0.1:7650", "10.0.0.2:7650"], false).await;

        let response = h
            .machine
            .handle_vote_request(3, "10.0.0.1:7650", &position("mysql-bin.000002", 100))
            .await;
        match response {
            Message::VoteResponse { granted, term, .. } => {
                assert!(granted);
                assert_eq!(term, 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        // Different candidate, same term: denied
        let response = h
            .machine
            .handle_vote_request(3, "10.0.0.2:7650", &position("mysql-bin.000002", 100))
            .await;
        match response {
            Message::VoteResponse { granted, .. } => assert!(!granted),
            other => panic!("unexpected {:?}", other),
        }

        // Same candidate again: re-granted
        let response = h
            .machine
            .handle_vote_request(3, "10.0.0.1:7650", &position("mysql-bin.000002", 100))
            .await;
        match response {
            Message::VoteResponse { granted, .. } => assert!(granted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_vote_denied_for_stale_term() {
        let h = harness(&["10.0.0.1:7650"], false).await;
        h.store.set_current_term(5).await.unwrap();
        h.machine.start().await.unwrap();

        let response = h
            .machine
            .handle_vote_request(4, "10.0.0.1:7650", &position("mysql-bin.000009", 0))
            .await;
        match response {
            Message::VoteResponse { granted, term, .. } => {
                assert!(!granted);
                assert_eq!(term, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_vote_denied_for_stale_position() {
        let h = harness(&["10.0.0.1:7650"], false).await;
        h.machine
            .set_position(Some(position("mysql-bin.000007", 500)))
            .await;

        let response = h
            .machine
            .handle_vote_request(2, "10.0.0.1:7650", &position("mysql-bin.000007", 400))
            .await;
        match response {
            Message::VoteResponse { granted, .. } => assert!(!granted),
            other => panic!("unexpected {:?}", other),
        }

        // Equal position is acceptable
        let response = h
            .machine
            .handle_vote_request(2, "10.0.0.1:7650", &position("mysql-bin.000007", 500))
            .await;
        match response {
            Message::VoteResponse { granted, .. } => assert!(granted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_vote_persisted_before_response_survives_restart() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().to_path_buf()).unwrap());

        {
            let membership = Arc::new(Membership::new(
                "10.0.0.5:7650".to_string(),
                3,
                Arc::clone(&store),
            ));
            membership
                .bootstrap(&["10.0.0.1:7650".to_string(), "10.0.0.2:7650".to_string()])
                .await
                .unwrap();
            let (tx, _rx) = mpsc::unbounded_channel();
            let machine = ElectionMachine::new(
                "10.0.0.5:7650".to_string(),
                ElectionConfig::default(),
                membership,
                Arc::clone(&store),
                RpcClient::new(Duration::from_millis(50)),
                tx,
            );
            machine.start().await.unwrap();
            let response = machine
                .handle_vote_request(4, "10.0.0.1:7650", &position("mysql-bin.000001", 10))
                .await;
            assert!(matches!(
                response,
                Message::VoteResponse { granted: true, .. }
            ));
            // Crash here: the machine is dropped with the grant persisted
        }

        let membership = Arc::new(Membership::new(
            "10.0.0.5:7650".to_string(),
            3,
            Arc::clone(&store),
        ));
        membership.bootstrap(&[]).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let machine = ElectionMachine::new(
            "10.0.0.5:7650".to_string(),
            ElectionConfig::default(),
            membership,
            Arc::clone(&store),
            RpcClient::new(Duration::from_millis(50)),
            tx,
        );
        machine.start().await.unwrap();

        // Same term, different candidate: the restarted node must not grant
        let response = machine
            .handle_vote_request(4, "10.0.0.2:7650", &position("mysql-bin.000009", 0))
            .await;
        assert!(matches!(
            response,
            Message::VoteResponse { granted: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_steps_leader_down_and_releases() {
        let mut h = harness(&[], false).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        h.machine.maybe_campaign().await.unwrap();
        assert!(h.machine.is_leader().await);
        assert_eq!(
            h.transitions.try_recv().unwrap(),
            RoleTransition::Acquire { term: 1 }
        );

        let response = h
            .machine
            .handle_heartbeat(2, "10.0.0.9:7650", None, 0, &[])
            .await;
        assert!(matches!(
            response,
            Message::HeartbeatResponse { success: true, .. }
        ));

        assert_eq!(h.machine.role().await, Role::Follower);
        assert_eq!(h.machine.term().await, 2);
        assert_eq!(h.machine.leader().await, Some("10.0.0.9:7650".to_string()));
        assert_eq!(
            h.transitions.try_recv().unwrap(),
            RoleTransition::Release { term: 2 }
        );
    }

    #[tokio::test]
    async fn test_stale_heartbeat_rejected() {
        let h = harness(&[], false).await;
        h.store.set_current_term(8).await.unwrap();
        h.machine.start().await.unwrap();

        let response = h
            .machine
            .handle_heartbeat(3, "10.0.0.9:7650", None, 0, &[])
            .await;
        match response {
            Message::HeartbeatResponse { success, term, .. } => {
                assert!(!success);
                assert_eq!(term, 8);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.machine.leader().await, None);
    }

    #[tokio::test]
    async fn test_candidate_yields_position_tie_to_smaller_address() {
        let mut h = harness(&["10.0.0.1:7650", "10.0.0.9:7650"], false).await;

        // Campaign against unreachable peers: stays candidate at term 1
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.machine.maybe_campaign().await.unwrap();
        assert_eq!(h.machine.role().await, Role::Candidate);
        let term = h.machine.term().await;

        // Larger-address candidate at the same position: no yield
        let response = h
            .machine
            .handle_vote_request(term, "10.0.0.9:7650", &position("", 0))
            .await;
        assert!(matches!(
            response,
            Message::VoteResponse { granted: false, .. }
        ));
        assert_eq!(h.machine.role().await, Role::Candidate);

        // Smaller-address candidate at the same position: yield, still deny
        let response = h
            .machine
            .handle_vote_request(term, "10.0.0.1:7650", &position("", 0))
            .await;
        assert!(matches!(
            response,
            Message::VoteResponse { granted: false, .. }
        ));
        assert_eq!(h.machine.role().await, Role::Follower);
        assert!(h.transitions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_halted_node_grants_nothing() {
        let h = harness(&["10.0.0.1:7650"], false).await;
        h.machine.halt("test").await;

        let response = h
            .machine
            .handle_vote_request(2, "10.0.0.1:7650", &position("mysql-bin.000009", 0))
            .await;
        assert!(matches!(
            response,
            Message::VoteResponse { granted: false, .. }
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        h.machine.maybe_campaign().await.unwrap();
        assert_eq!(h.machine.role().await, Role::Follower);
    }

    #[tokio::test]
    async fn test_exactly_once_transitions_across_flaps() {
        let mut h = harness(&[], false).await;

        let mut acquires = 0u32;
        let mut releases = 0u32;
        let mut term = 0u64;

        for _ in 0..20 {
            // Win a single-node election
            tokio::time::sleep(Duration::from_millis(120)).await;
            h.machine.maybe_campaign().await.unwrap();
            assert!(h.machine.is_leader().await);

            // A higher-term leader appears and we step down
            term = h.machine.term().await + 1;
            h.machine
                .handle_heartbeat(term, "10.0.0.9:7650", None, 0, &[])
                .await;
            assert_eq!(h.machine.role().await, Role::Follower);

            while let Ok(event) = h.transitions.try_recv() {
                match event {
                    RoleTransition::Acquire { .. } => acquires += 1,
                    RoleTransition::Release { .. } => releases += 1,
                }
            }
        }

        assert_eq!(acquires, 20);
        assert_eq!(releases, 20);
        assert!(h.machine.term().await >= term);
    }

    #[tokio::test]
    async fn test_election_in_flight_blocks_reconfiguration() {
        let h = harness(&["10.0.0.1:7650", "10.0.0.9:7650"], false).await;
        assert!(!h.machine.election_in_flight().await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        h.machine.maybe_campaign().await.unwrap();
        assert_eq!(h.machine.role().await, Role::Candidate);
        assert!(h.machine.election_in_flight().await);

        // Election resolves: a leader heartbeat arrives
        h.machine
            .handle_heartbeat(h.machine.term().await, "10.0.0.1:7650", None, 0, &[])
            .await;
        assert!(!h.machine.election_in_flight().await);

        let _ = h.membership;
    }

    #[tokio::test]
    async fn test_idle_still_grants_votes() {
        let h = harness(&["10.0.0.1:7650"], true).await;
        assert_eq!(h.machine.role().await, Role::Idle);

        let response = h
            .machine
            .handle_vote_request(2, "10.0.0.1:7650", &position("mysql-bin.000001", 1))
            .await;
        assert!(matches!(
            response,
            Message::VoteResponse { granted: true, .. }
        ));
    }
}
