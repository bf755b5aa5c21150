//! Node Runtime
//!
//! Wires the election machine, membership registry, replication controller,
//! and transports into a running daemon, and dispatches inbound RPCs to
//! them. Also home of the guarded membership operations shared by the RPC
//! and HTTP surfaces: leader-only, and rejected with Busy while an election
//! is in flight.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

use crate::api::HttpServer;
use crate::config::VigilConfig;
use crate::executor::MySqlAdmin;
use crate::network::protocol::{ErrorCode, LivenessCode, Message, NodeEntry};
use crate::network::{RpcClient, RpcHandler, RpcServer};
use crate::replication::{
    BinlogPurger, CommandRunner, ControllerSettings, HealthProbe, ReplicationController,
};
use crate::state::{ElectionConfig, ElectionMachine, Membership, MetaStore, RoleTransition};
use crate::error::{Error, Result};

/// Overall deadline for loops to wind down after shutdown is signalled
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Reject a reconfiguration unless this node is the settled leader
async fn guard_reconfiguration(machine: &ElectionMachine) -> Result<()> {
    if machine.is_halted().await {
        return Err(Error::Persist("Node has halted participation".into()));
    }
    if machine.election_in_flight().await {
        return Err(Error::Busy("Election in flight, retry after it resolves".into()));
    }
    if !machine.is_leader().await {
        return Err(Error::NotLeader(machine.leader().await));
    }
    Ok(())
}

/// Leader-only AddNode, shared by the RPC and HTTP surfaces
pub async fn guarded_add_nodes(
    machine: &Arc<ElectionMachine>,
    membership: &Arc<Membership>,
    addresses: &[String],
) -> Result<u64> {
    guard_reconfiguration(machine).await?;

    match membership.add_nodes(addresses).await {
        Ok(version) => {
            machine.trigger_heartbeat();
            Ok(version)
        }
        Err(e) => {
            if e.is_fatal() {
                machine.halt(&e.to_string()).await;
            }
            Err(e)
        }
    }
}

/// Leader-only RemoveNode, shared by the RPC and HTTP surfaces
pub async fn guarded_remove_nodes(
    machine: &Arc<ElectionMachine>,
    membership: &Arc<Membership>,
    addresses: &[String],
) -> Result<u64> {
    guard_reconfiguration(machine).await?;

    match membership.remove_nodes(addresses).await {
        Ok(version) => {
            machine.trigger_heartbeat();
            Ok(version)
        }
        Err(e) => {
            if e.is_fatal() {
                machine.halt(&e.to_string()).await;
            }
            Err(e)
        }
    }
}

fn error_message(error: Error) -> Message {
    let code = match &error {
        Error::NotLeader(_) => ErrorCode::NotLeader,
        Error::Busy(_) => ErrorCode::Busy,
        Error::Persist(_) => ErrorCode::Halted,
        _ => ErrorCode::Internal,
    };
    Message::Error {
        code,
        message: error.to_string(),
    }
}

/// Dispatches inbound RPCs to the consensus and membership layers
pub struct ClusterHandler {
    machine: Arc<ElectionMachine>,
    membership: Arc<Membership>,
}

impl ClusterHandler {
    pub fn new(machine: Arc<ElectionMachine>, membership: Arc<Membership>) -> Self {
        Self {
            machine,
            membership,
        }
    }

    async fn status_response(&self) -> Message {
        let status = self.machine.status().await;
        Message::StatusResponse {
            node: status.address,
            role: status.role,
            term: status.term,
            leader: status.leader,
            config_version: self.membership.version().await,
            peers: self.membership.peer_statuses().await,
            degraded: status.degraded,
            replication_inconsistent: status.replication_inconsistent,
        }
    }

    async fn nodes_response(&self) -> Message {
        let mut nodes = vec![NodeEntry {
            address: self.machine.address().to_string(),
            role: self.machine.role().await,
        }];
        for peer in self.membership.peers().await {
            nodes.push(NodeEntry {
                address: peer.address,
                role: peer.role,
            });
        }
        Message::NodesResponse { nodes }
    }
}

#[async_trait::async_trait]
impl RpcHandler for ClusterHandler {
    async fn handle(&self, peer: &str, message: Message) -> Message {
        match message {
            Message::VoteRequest {
                term,
                candidate,
                position,
            } => {
                self.machine
                    .handle_vote_request(term, &candidate, &position)
                    .await
            }
            Message::Heartbeat {
                term,
                leader,
                position,
                config_version,
                members,
            } => {
                self.machine
                    .handle_heartbeat(term, &leader, position, config_version, &members)
                    .await
            }
            Message::Ping => {
                let code = if self.machine.is_degraded().await {
                    LivenessCode::Degraded
                } else {
                    LivenessCode::Ok
                };
                Message::Pong { code }
            }
            Message::StatusRequest => self.status_response().await,
            Message::NodesRequest => self.nodes_response().await,
            Message::AddNode { addresses } => {
                match guarded_add_nodes(&self.machine, &self.membership, &addresses).await {
                    Ok(version) => Message::MembershipResponse { version },
                    Err(e) => error_message(e),
                }
            }
            Message::RemoveNode { addresses } => {
                match guarded_remove_nodes(&self.machine, &self.membership, &addresses).await {
                    Ok(version) => Message::MembershipResponse { version },
                    Err(e) => error_message(e),
                }
            }
            other => {
                tracing::debug!("Unsolicited {} from {}", other.type_name(), peer);
                Message::Error {
                    code: ErrorCode::Internal,
                    message: format!("Unexpected {}", other.type_name()),
                }
            }
        }
    }
}

/// A running Vigil node
pub struct Node {
    config: VigilConfig,
    machine: Arc<ElectionMachine>,
    membership: Arc<Membership>,
    controller: Arc<ReplicationController>,
    server: Arc<RpcServer>,
    http: Arc<HttpServer>,
    shutdown: watch::Sender<bool>,
    transitions: Mutex<Option<mpsc::UnboundedReceiver<RoleTransition>>>,
}

impl Node {
    /// Assemble a node from configuration and its external collaborators
    pub fn new(
        config: VigilConfig,
        executor: Arc<MySqlAdmin>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let address = config.advertise_address().to_string();
        let store = Arc::new(MetaStore::open(config.state_dir())?);

        let membership = Arc::new(Membership::new(
            address.clone(),
            config.cluster.suspect_threshold,
            Arc::clone(&store),
        ));

        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();
        let machine = Arc::new(ElectionMachine::new(
            address,
            ElectionConfig {
                election_timeout: config.election_timeout(),
                heartbeat_timeout: config.heartbeat_timeout(),
                start_as_idle: config.node.start_as_idle,
            },
            Arc::clone(&membership),
            store,
            RpcClient::new(config.request_timeout()),
            transitions_tx,
        ));

        let controller = Arc::new(ReplicationController::new(
            ControllerSettings {
                leader_start_command: config.replication.leader_start_command.clone(),
                leader_stop_command: config.replication.leader_stop_command.clone(),
                backup_command: config.replication.backup_command.clone(),
                command_timeout: config.command_timeout(),
            },
            executor,
            Arc::clone(&machine),
            Arc::clone(&membership),
            runner,
        ));

        let handler = Arc::new(ClusterHandler::new(
            Arc::clone(&machine),
            Arc::clone(&membership),
        ));
        let server = Arc::new(RpcServer::new(config.node.bind_address.clone(), handler));

        let http = Arc::new(HttpServer::new(
            config.api.clone(),
            Arc::clone(&machine),
            Arc::clone(&membership),
            Arc::clone(&controller),
        ));

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            machine,
            membership,
            controller,
            server,
            http,
            shutdown,
            transitions: Mutex::new(Some(transitions_rx)),
        })
    }

    pub fn machine(&self) -> &Arc<ElectionMachine> {
        &self.machine
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn controller(&self) -> &Arc<ReplicationController> {
        &self.controller
    }

    /// Signal every loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Run the node until shutdown: bootstrap persisted state, start every
    /// background loop, then drain and stop in order.
    pub async fn run(&self) -> Result<()> {
        self.membership.bootstrap(&self.config.cluster.peers).await?;
        self.machine.start().await?;

        let transitions = self
            .transitions
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Internal("Node is already running".into()))?;

        let mut tasks = JoinSet::new();

        {
            let server = Arc::clone(&self.server);
            tasks.spawn(async move {
                if let Err(e) = server.start().await {
                    tracing::error!("RPC server error: {}", e);
                }
            });
        }
        {
            let machine = Arc::clone(&self.machine);
            let shutdown = self.shutdown.subscribe();
            tasks.spawn(async move { machine.run(shutdown).await });
        }
        {
            let machine = Arc::clone(&self.machine);
            let shutdown = self.shutdown.subscribe();
            tasks.spawn(async move { machine.run_heartbeats(shutdown).await });
        }
        {
            let controller = Arc::clone(&self.controller);
            let shutdown = self.shutdown.subscribe();
            tasks.spawn(async move { controller.run_transitions(transitions, shutdown).await });
        }
        {
            let probe = HealthProbe::new(
                Arc::clone(&self.controller),
                self.config.ping_interval(),
                self.config.replication.max_ping_failures,
            );
            let shutdown = self.shutdown.subscribe();
            tasks.spawn(async move { probe.run(shutdown).await });
        }
        {
            let purger = BinlogPurger::new(
                Arc::clone(&self.controller),
                self.config.purge_interval(),
                self.config.replication.purge_binlog_disabled,
            );
            let shutdown = self.shutdown.subscribe();
            tasks.spawn(async move { purger.run(shutdown).await });
        }
        {
            let http = Arc::clone(&self.http);
            let shutdown = self.shutdown.subscribe();
            tasks.spawn(async move {
                if let Err(e) = http.start(shutdown).await {
                    tracing::error!("HTTP server error: {}", e);
                }
            });
        }

        // Block until shutdown is signalled
        let mut shutdown = self.shutdown.subscribe();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        tracing::info!("Shutting down node");
        self.server.stop();

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Shutdown deadline elapsed, aborting remaining loops");
            tasks.shutdown().await;
        }

        tracing::info!("Node shutdown complete");
        Ok(())
    }
}
