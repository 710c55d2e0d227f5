//! Health Classification
//!
//! Maps a member, its latest probe and its probe history to a health state.

use serde::{Deserialize, Serialize};

use super::probe::{ProbeHistory, StatusProbe};
use crate::state::Member;

/// Health of a single member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    /// Reachable and reporting no errors
    Available,
    /// Registered but its process has never joined
    NotStarted,
    /// Reporting errors, or unreachable after having answered before
    Unhealthy,
    /// Unreachable and never heard from
    Unknown,
}

impl HealthState {
    /// Only Available members count as healthy
    pub fn is_available(&self) -> bool {
        matches!(self, HealthState::Available)
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Available => write!(f, "AVAILABLE"),
            HealthState::NotStarted => write!(f, "NOT_STARTED"),
            HealthState::Unhealthy => write!(f, "UNHEALTHY"),
            HealthState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Stateless member health classifier
pub struct HealthClassifier;

impl HealthClassifier {
    /// Classify a member from its latest probe and the history before it
    ///
    /// `history` must not yet include `probe`.
    pub fn classify(member: &Member, probe: &StatusProbe, history: &ProbeHistory) -> HealthState {
        if probe.reachable() {
            if probe.errors.is_empty() {
                return HealthState::Available;
            }
            return HealthState::Unhealthy;
        }

        if history.has_succeeded() {
            // Answered before, silent now
            return HealthState::Unhealthy;
        }

        if !member.is_started() {
            return HealthState::NotStarted;
        }

        HealthState::Unknown
    }
}
