//! Replication Controller
//!
//! Executes the side effects of confirmed role transitions: the operator
//! supplied leader-start/stop commands, run exactly once per transition
//! event. Commands execute outside the election machine's lock, on the
//! single consumer of the transition channel, so a slow external command
//! never blocks heartbeat or RPC processing and a release always resolves
//! before the next acquire for this node.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};

use crate::executor::MySqlAdmin;
use crate::network::protocol::BinlogPosition;
use crate::state::{ElectionMachine, Membership, RoleTransition};
use crate::error::{Error, Result};

/// Bounded history of executed commands
const RECORD_HISTORY: usize = 64;

/// Kind of external command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandKind {
    LeaderStart,
    LeaderStop,
    Backup,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::LeaderStart => write!(f, "leader-start"),
            CommandKind::LeaderStop => write!(f, "leader-stop"),
            CommandKind::Backup => write!(f, "backup"),
        }
    }
}

/// Outcome of an external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CommandStatus {
    Success,
    Failed { code: Option<i32> },
    TimedOut,
    /// No command configured for this transition
    Skipped,
}

/// Record of a single command execution
#[derive(Debug, Clone, Serialize)]
pub struct CommandExecutionRecord {
    pub kind: CommandKind,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub status: CommandStatus,
}

/// Seam for external command execution, mocked in tests
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, kind: CommandKind, command: &str, timeout: Duration) -> CommandStatus;
}

/// Runs commands through `sh -c`
pub struct ShellRunner;

#[async_trait::async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, kind: CommandKind, command: &str, timeout: Duration) -> CommandStatus {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => {
                if output.status.success() {
                    tracing::info!("{} command succeeded", kind);
                    CommandStatus::Success
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    tracing::error!(
                        "{} command exited with {:?}: {}",
                        kind,
                        output.status.code(),
                        stderr.trim()
                    );
                    CommandStatus::Failed {
                        code: output.status.code(),
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::error!("{} command failed to spawn: {}", kind, e);
                CommandStatus::Failed { code: None }
            }
            Err(_) => {
                tracing::error!("{} command timed out after {:?}", kind, timeout);
                CommandStatus::TimedOut
            }
        }
    }
}

/// Role-derived replication view
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationState {
    /// Current master address, when this node holds leadership
    pub master: Option<String>,
    /// This node's replication position
    pub position: Option<BinlogPosition>,
    /// Last position binlogs were purged up to
    pub purge_cursor: Option<BinlogPosition>,
}

/// Controller settings
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub leader_start_command: String,
    pub leader_stop_command: String,
    pub backup_command: String,
    pub command_timeout: Duration,
}

/// The replication controller
pub struct ReplicationController {
    settings: ControllerSettings,
    executor: Arc<MySqlAdmin>,
    machine: Arc<ElectionMachine>,
    membership: Arc<Membership>,
    runner: Arc<dyn CommandRunner>,
    state: RwLock<ReplicationState>,
    records: RwLock<VecDeque<CommandExecutionRecord>>,
}

impl ReplicationController {
    pub fn new(
        settings: ControllerSettings,
        executor: Arc<MySqlAdmin>,
        machine: Arc<ElectionMachine>,
        membership: Arc<Membership>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            settings,
            executor,
            machine,
            membership,
            runner,
            state: RwLock::new(ReplicationState::default()),
            records: RwLock::new(VecDeque::new()),
        }
    }

    /// Consume role transitions until shutdown.
    ///
    /// The receiver is the per-node single-flight queue: transitions execute
    /// strictly in order, one at a time, and a pending release always
    /// finishes (or times out) before a later acquire starts.
    pub async fn run_transitions(
        &self,
        mut transitions: mpsc::UnboundedReceiver<RoleTransition>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = transitions.recv() => {
                    match event {
                        Some(RoleTransition::Acquire { term }) => self.handle_acquire(term).await,
                        Some(RoleTransition::Release { term }) => self.handle_release(term).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Transition loop stopped");
    }

    async fn handle_acquire(&self, term: u64) {
        tracing::info!("Acquired leadership for term {}, starting leader role", term);

        let status = self
            .execute(CommandKind::LeaderStart, &self.settings.leader_start_command)
            .await;

        match status {
            CommandStatus::Success | CommandStatus::Skipped => {
                let mut state = self.state.write().await;
                state.master = Some(self.machine.address().to_string());
                self.machine.set_replication_inconsistent(false).await;
            }
            _ => {
                // The node stays leader at the consensus layer; operators see
                // the inconsistency through status.
                self.machine.set_replication_inconsistent(true).await;
                tracing::error!(
                    "leader-start failed for term {}: replication state inconsistent",
                    term
                );
            }
        }
    }

    async fn handle_release(&self, term: u64) {
        tracing::info!("Released leadership at term {}, stopping leader role", term);

        let status = self
            .execute(CommandKind::LeaderStop, &self.settings.leader_stop_command)
            .await;

        {
            let mut state = self.state.write().await;
            state.master = None;
        }

        match status {
            CommandStatus::Success | CommandStatus::Skipped => {
                self.machine.set_replication_inconsistent(false).await;
            }
            _ => {
                self.machine.set_replication_inconsistent(true).await;
                tracing::error!(
                    "leader-stop failed at term {}: replication state inconsistent",
                    term
                );
            }
        }
    }

    /// Run the operator backup command on demand
    pub async fn backup(&self) -> Result<CommandExecutionRecord> {
        if self.settings.backup_command.is_empty() {
            return Err(Error::Config("No backup command configured".into()));
        }

        let status = self
            .execute(CommandKind::Backup, &self.settings.backup_command)
            .await;
        let record = self
            .records
            .read()
            .await
            .back()
            .cloned()
            .ok_or_else(|| Error::Internal("Backup record missing".into()))?;

        match status {
            CommandStatus::Success => Ok(record),
            _ => Err(Error::CommandExecution {
                kind: CommandKind::Backup.to_string(),
                reason: format!("{:?}", status),
            }),
        }
    }

    async fn execute(&self, kind: CommandKind, command: &str) -> CommandStatus {
        let started_at = chrono::Utc::now();
        let status = if command.is_empty() {
            tracing::debug!("No {} command configured", kind);
            CommandStatus::Skipped
        } else {
            self.runner
                .run(kind, command, self.settings.command_timeout)
                .await
        };

        let record = CommandExecutionRecord {
            kind,
            started_at,
            finished_at: chrono::Utc::now(),
            status: status.clone(),
        };

        let mut records = self.records.write().await;
        if records.len() == RECORD_HISTORY {
            records.pop_front();
        }
        records.push_back(record);

        status
    }

    /// Snapshot the command execution history
    pub async fn records(&self) -> Vec<CommandExecutionRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    /// Snapshot the replication state
    pub async fn replication_state(&self) -> ReplicationState {
        self.state.read().await.clone()
    }

    /// Update this node's replication position (health probe)
    pub async fn set_position(&self, position: Option<BinlogPosition>) {
        self.state.write().await.position = position;
    }

    /// Record the purge cursor (binlog purge loop)
    pub async fn set_purge_cursor(&self, cursor: BinlogPosition) {
        self.state.write().await.purge_cursor = Some(cursor);
    }

    pub(crate) fn executor(&self) -> &Arc<MySqlAdmin> {
        &self.executor
    }

    pub(crate) fn machine(&self) -> &Arc<ElectionMachine> {
        &self.machine
    }

    pub(crate) fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    use crate::network::RpcClient;
    use crate::state::{ElectionConfig, MetaStore};

    /// Counts executions per command kind; optionally fails them
    pub(crate) struct MockRunner {
        pub counts: Mutex<HashMap<CommandKind, u32>>,
        pub fail: Mutex<bool>,
    }

    impl MockRunner {
        pub(crate) fn new() -> Self {
            Self {
                counts: Mutex::new(HashMap::new()),
                fail: Mutex::new(false),
            }
        }

        pub(crate) fn count(&self, kind: CommandKind) -> u32 {
            *self.counts.lock().unwrap().get(&kind).unwrap_or(&0)
        }
    }

    #[async_trait::async_trait]
    impl CommandRunner for MockRunner {
        async fn run(
            &self,
            kind: CommandKind,
            _command: &str,
            _timeout: Duration,
        ) -> CommandStatus {
            *self.counts.lock().unwrap().entry(kind).or_insert(0) += 1;
            if *self.fail.lock().unwrap() {
                CommandStatus::Failed { code: Some(1) }
            } else {
                CommandStatus::Success
            }
        }
    }

    pub(crate) struct Fixture {
        pub controller: Arc<ReplicationController>,
        pub machine: Arc<ElectionMachine>,
        pub membership: Arc<Membership>,
        pub executor: Arc<MySqlAdmin>,
        pub runner: Arc<MockRunner>,
        pub transitions_tx: mpsc::UnboundedSender<RoleTransition>,
        pub transitions_rx: Option<mpsc::UnboundedReceiver<RoleTransition>>,
        pub _dir: tempfile::TempDir,
    }

    pub(crate) async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(MetaStore::open(dir.path().to_path_buf()).unwrap());
        let membership = Arc::new(Membership::new(
            "10.0.0.5:7650".to_string(),
            3,
            Arc::clone(&store),
        ));
        membership.bootstrap(&[]).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Arc::new(ElectionMachine::new(
            "10.0.0.5:7650".to_string(),
            ElectionConfig {
                election_timeout: Duration::from_millis(50),
                heartbeat_timeout: Duration::from_millis(20),
                start_as_idle: false,
            },
            Arc::clone(&membership),
            store,
            RpcClient::new(Duration::from_millis(50)),
            tx.clone(),
        ));
        machine.start().await.unwrap();

        let executor = Arc::new(MySqlAdmin::new_mock());
        let runner = Arc::new(MockRunner::new());
        let controller = Arc::new(ReplicationController::new(
            ControllerSettings {
                leader_start_command: "leader-start.sh".into(),
                leader_stop_command: "leader-stop.sh".into(),
                backup_command: "backup.sh".into(),
                command_timeout: Duration::from_secs(1),
            },
            Arc::clone(&executor),
            Arc::clone(&machine),
            Arc::clone(&membership),
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
        ));

        Fixture {
            controller,
            machine,
            membership,
            executor,
            runner,
            transitions_tx: tx,
            transitions_rx: Some(rx),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_exactly_once_per_transition_event() {
        let mut f = fixture().await;
        let rx = f.transitions_rx.take().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let controller = Arc::clone(&f.controller);
        let worker =
            tokio::spawn(async move { controller.run_transitions(rx, shutdown_rx).await });

        // Randomized flap sequence: every acquire is matched by a release
        let mut acquires = 0u32;
        let flaps = 100 + (rand::random::<u32>() % 25);
        for term in 1..=flaps as u64 {
            f.transitions_tx
                .send(RoleTransition::Acquire { term })
                .unwrap();
            f.transitions_tx
                .send(RoleTransition::Release { term })
                .unwrap();
            acquires += 1;
        }

        // The single consumer drains the queue in order
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while f.runner.count(CommandKind::LeaderStart) < acquires
            || f.runner.count(CommandKind::LeaderStop) < acquires
        {
            assert!(
                std::time::Instant::now() < deadline,
                "transition queue did not drain"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();

        assert_eq!(f.runner.count(CommandKind::LeaderStart), acquires);
        assert_eq!(f.runner.count(CommandKind::LeaderStop), acquires);
    }

    #[tokio::test]
    async fn test_failed_leader_start_flags_inconsistency() {
        let f = fixture().await;
        *f.runner.fail.lock().unwrap() = true;

        f.controller.handle_acquire(3).await;

        let status = f.machine.status().await;
        assert!(status.replication_inconsistent);
        assert!(f.controller.replication_state().await.master.is_none());

        // A later successful release clears the flag
        *f.runner.fail.lock().unwrap() = false;
        f.controller.handle_release(3).await;
        let status = f.machine.status().await;
        assert!(!status.replication_inconsistent);
    }

    #[tokio::test]
    async fn test_acquire_sets_master_to_self() {
        let f = fixture().await;

        f.controller.handle_acquire(2).await;
        assert_eq!(
            f.controller.replication_state().await.master,
            Some("10.0.0.5:7650".to_string())
        );

        f.controller.handle_release(2).await;
        assert!(f.controller.replication_state().await.master.is_none());
    }

    #[tokio::test]
    async fn test_backup_records_execution() {
        let f = fixture().await;

        let record = f.controller.backup().await.unwrap();
        assert_eq!(record.kind, CommandKind::Backup);
        assert_eq!(record.status, CommandStatus::Success);
        assert_eq!(f.runner.count(CommandKind::Backup), 1);
    }

    #[tokio::test]
    async fn test_record_history_is_bounded() {
        let f = fixture().await;

        for term in 0..(RECORD_HISTORY as u64) {
            f.controller.handle_acquire(term).await;
            f.controller.handle_release(term).await;
        }

        assert_eq!(f.controller.records().await.len(), RECORD_HISTORY);
    }
}
