//! Replication Module
//!
//! Drives MySQL's replication topology from confirmed role transitions:
//! external leader-start/stop commands, the local health probe, and the
//! leader's binlog purge loop.

pub(crate) mod controller;
mod health;
mod purge;

pub use controller::{
    CommandExecutionRecord, CommandKind, CommandRunner, CommandStatus, ControllerSettings,
    ReplicationController, ReplicationState, ShellRunner,
};
pub use health::HealthProbe;
pub use purge::BinlogPurger;
