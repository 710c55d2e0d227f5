//! Membership Module
//!
//! Quorum-guarded changes to the cluster roster.

mod operation;
mod mutator;

pub use operation::{MutationKind, MutationOutcome, MutationStatus, OperationState};
pub use mutator::MembershipMutator;
