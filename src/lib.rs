//! Kafka Runner - Broker Id Allocation and Supervision
//!
//! Starts a Kafka broker under a broker id that no other member of the cluster
//! holds, then keeps it running.
//!
//! # Architecture
//!
//! The runner reads which broker ids are registered in ZooKeeper, picks one of
//! the missing ids at random and wins it through a ZooKeeper election. Once the
//! seat is won the broker is started and restarted whenever it exits. If the
//! ZooKeeper session expires, the runner reconnects and campaigns for the same
//! id again; it never switches ids mid-run.
//!
//! # Fatal conditions
//!
//! - Every broker id is already registered
//! - The election budget (`3 × broker_count` votes) is spent
//! - The broker restarts faster than the flap threshold allows

pub mod config;
pub mod error;
pub mod coordination;
pub mod identity;
pub mod election;
pub mod supervisor;
pub mod runner;
pub mod tuning;

pub use config::RunnerConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ClusterConfig, RunnerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::coordination::{Coordinator, Session, Contender, VoteOutcome};
    pub use crate::election::{ElectionCampaign, ElectionState};
    pub use crate::supervisor::{ProcessSupervisor, IdentityLease};
    pub use crate::runner::{Runner, RunOptions};
}
