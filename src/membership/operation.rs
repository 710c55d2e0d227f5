//! Membership Operation Tracking
//!
//! Each mutation walks Proposed → QuorumChecked → Applied, or ends in
//! Failed. The trail is kept on the outcome and mirrored in the logs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::state::Member;

/// Lifecycle state of a membership operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Proposed,
    QuorumChecked,
    Applied,
    Failed,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationState::Proposed => write!(f, "PROPOSED"),
            OperationState::QuorumChecked => write!(f, "QUORUM_CHECKED"),
            OperationState::Applied => write!(f, "APPLIED"),
            OperationState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Kind of membership operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationKind {
    Add,
    AddLearner,
    Promote,
    Remove,
    UpdatePeerUrls,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Add => write!(f, "add"),
            MutationKind::AddLearner => write!(f, "add-learner"),
            MutationKind::Promote => write!(f, "promote"),
            MutationKind::Remove => write!(f, "remove"),
            MutationKind::UpdatePeerUrls => write!(f, "update-peer-urls"),
        }
    }
}

/// How a successful operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
    /// The change was applied
    Applied,
    /// The change had already been applied; nothing was done
    NoOp,
}

/// Result of a successful membership operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub operation_id: Uuid,
    pub kind: MutationKind,
    pub status: MutationStatus,
    /// The affected member as recorded after the operation
    pub member: Member,
    /// States the operation passed through
    pub trail: Vec<OperationState>,
}

impl MutationOutcome {
    /// Whether this was a retry of an already-completed operation
    pub fn is_noop(&self) -> bool {
        self.status == MutationStatus::NoOp
    }
}

/// In-flight operation
pub(crate) struct Operation {
    id: Uuid,
    kind: MutationKind,
    target: String,
    trail: Vec<OperationState>,
}

impl Operation {
    pub(crate) fn propose(kind: MutationKind, target: impl Into<String>) -> Self {
        let op = Self {
            id: Uuid::new_v4(),
            kind,
            target: target.into(),
            trail: vec![OperationState::Proposed],
        };
        tracing::debug!("[{}] {} {} proposed", op.id, op.kind, op.target);
        op
    }

    pub(crate) fn advance(&mut self, state: OperationState) {
        tracing::debug!("[{}] {} {} -> {}", self.id, self.kind, self.target, state);
        self.trail.push(state);
    }

    /// Finish the operation with the result of its body
    ///
    /// `Err(elapsed)` means the body was cut short by its deadline.
    pub(crate) fn conclude(
        mut self,
        result: std::result::Result<Result<(MutationStatus, Member)>, tokio::time::error::Elapsed>,
    ) -> Result<MutationOutcome> {
        let result = result.unwrap_or_else(|_| {
            Err(Error::Timeout(format!("{} {}", self.kind, self.target)))
        });

        match result {
            Ok((status, member)) => {
                if status == MutationStatus::Applied {
                    self.trail.push(OperationState::Applied);
                    tracing::info!("[{}] {} {} applied", self.id, self.kind, member);
                } else {
                    tracing::info!("[{}] {} {} already applied, nothing to do", self.id, self.kind, member);
                }
                Ok(MutationOutcome {
                    operation_id: self.id,
                    kind: self.kind,
                    status,
                    member,
                    trail: self.trail,
                })
            }
            Err(e) => {
                self.trail.push(OperationState::Failed);
                tracing::warn!(
                    "[{}] {} {} failed after {:?}: {}",
                    self.id,
                    self.kind,
                    self.target,
                    self.trail,
                    e
                );
                Err(e)
            }
        }
    }
}
