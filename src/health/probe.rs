//! Status Probes
//!
//! Point-in-time status reports from a single member, and the per-member
//! history that classification takes into account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::MemberId;

/// Why a probe produced no status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeFailure {
    /// The store could not be reached
    Transport(String),
    /// No answer before the probe deadline
    Timeout,
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::Transport(reason) => write!(f, "transport failure: {}", reason),
            ProbeFailure::Timeout => write!(f, "probe timed out"),
        }
    }
}

/// Status reported by one member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusProbe {
    /// Member the probe was issued to
    pub member_id: MemberId,
    /// Set when the probe failed; all other fields are then zeroed
    pub failure: Option<ProbeFailure>,
    /// Physically allocated database size in bytes
    pub db_size: u64,
    /// Logically used database size in bytes
    pub db_size_in_use: u64,
    /// Current store revision
    pub revision: u64,
    /// Raft term
    pub raft_term: u64,
    /// Raft index
    pub raft_index: u64,
    /// Leader as seen by this member
    pub leader: Option<MemberId>,
    /// Whether the member reports itself as a learner
    pub is_learner: bool,
    /// Alarms or errors reported by the member
    pub errors: Vec<String>,
    /// When the probe completed
    pub observed_at: DateTime<Utc>,
}

impl StatusProbe {
    /// A successful report with no alarms and empty statistics
    pub fn reported(member_id: MemberId) -> Self {
        Self {
            member_id,
            failure: None,
            db_size: 0,
            db_size_in_use: 0,
            revision: 0,
            raft_term: 0,
            raft_index: 0,
            leader: None,
            is_learner: false,
            errors: Vec::new(),
            observed_at: Utc::now(),
        }
    }

    /// A probe that never reached the member
    pub fn unreachable(member_id: MemberId, failure: ProbeFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::reported(member_id)
        }
    }

    /// Set database sizes
    pub fn with_db_size(mut self, db_size: u64, db_size_in_use: u64) -> Self {
        self.db_size = db_size;
        self.db_size_in_use = db_size_in_use;
        self
    }

    /// Set raft progress markers
    pub fn with_raft(mut self, term: u64, index: u64, revision: u64) -> Self {
        self.raft_term = term;
        self.raft_index = index;
        self.revision = revision;
        self
    }

    /// Set the leader this member follows
    pub fn with_leader(mut self, leader: MemberId) -> Self {
        self.leader = Some(leader);
        self
    }

    /// Attach reported errors
    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = errors;
        self
    }

    /// Whether the probe reached the member
    pub fn reachable(&self) -> bool {
        self.failure.is_none()
    }

    /// Bytes allocated but not in use
    pub fn fragmented_bytes(&self) -> u64 {
        self.db_size.saturating_sub(self.db_size_in_use)
    }

    /// Share of the database that is fragmented, 0..=100
    pub fn fragmented_percentage(&self) -> f64 {
        if self.db_size == 0 {
            return 0.0;
        }
        (self.fragmented_bytes() as f64 / self.db_size as f64) * 100.0
    }
}

/// Probe history of a single member
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeHistory {
    /// Number of probes that reached the member
    pub successes: u64,
    /// Failed probes since the last success
    pub consecutive_failures: u32,
    /// When the member was last reached
    pub last_success: Option<DateTime<Utc>>,
}

impl ProbeHistory {
    /// Whether the member has ever answered a probe
    pub fn has_succeeded(&self) -> bool {
        self.successes > 0
    }

    /// Fold a probe result into the history
    pub fn record(&mut self, probe: &StatusProbe) {
        if probe.reachable() {
            self.successes += 1;
            self.consecutive_failures = 0;
            self.last_success = Some(probe.observed_at);
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }
}
