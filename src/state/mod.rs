//! State Management Module
//!
//! The election state machine, the versioned cluster membership registry,
//! and the durable election metadata store behind them.

mod store;
mod membership;
pub mod election;

pub use store::MetaStore;
pub use membership::{ClusterConfiguration, Membership, Peer, Role};
pub use election::{ElectionConfig, ElectionMachine, NodeStatus, RoleTransition};
