//! Health Module
//!
//! Member status probes, per-member classification and the cluster-wide
//! health view built from them.

mod probe;
mod classifier;
mod view;

pub use probe::{ProbeFailure, ProbeHistory, StatusProbe};
pub use classifier::{HealthClassifier, HealthState};
pub use view::{ClusterHealthSnapshot, ClusterHealthView, MemberHealth};
