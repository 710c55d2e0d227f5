//! Maintenance Module
//!
//! Cluster-wide maintenance that must never run on two members at once.

mod defrag;

pub use defrag::{
    DefragOutcome, DefragReport, MaintenanceCoordinator, MemberDefrag, SkipReason,
};
