//! WolfQuorum - Cluster Membership and Health for Replicated Stores
//!
//! Tracks the members of a consensus cluster, classifies their health and
//! guards every membership change with a quorum check, so that no single
//! operation can leave the cluster without a healthy majority.
//!
//! # Architecture
//!
//! A [`ClusterManager`] owns one member registry and one operation lock.
//! Reads (roster listings, health snapshots) run concurrently; mutations
//! and maintenance are serialized through the lock. The store itself is
//! reached only through the [`transport::StoreTransport`] trait.
//!
//! # Features
//!
//! - Parallel, deadline-bounded health probes with per-member timeouts
//! - Quorum-checked add, promote and remove; idempotent remove retries
//! - Learner members that join without affecting quorum
//! - Rolling defragmentation, one member at a time, leader last
//! - In-memory fake store for deterministic tests

pub mod config;
pub mod error;
pub mod logging;
pub mod lock;
pub mod state;
pub mod health;
pub mod membership;
pub mod maintenance;
pub mod transport;
pub mod cluster;

pub use cluster::ClusterManager;
pub use config::WolfQuorumConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::ClusterManager;
    pub use crate::config::WolfQuorumConfig;
    pub use crate::error::{Error, Result};
    pub use crate::health::{ClusterHealthSnapshot, HealthState, StatusProbe};
    pub use crate::maintenance::{DefragOutcome, DefragReport};
    pub use crate::membership::{MutationOutcome, MutationStatus};
    pub use crate::state::{Member, MemberId};
    pub use crate::transport::{MembershipAck, MembershipChange, StoreTransport};
}
