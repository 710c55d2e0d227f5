//! Store Transport
//!
//! The three operations the core needs from the consensus store client.
//! Everything above this trait deals in structured results only.

pub mod fake;

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::health::StatusProbe;
use crate::state::{Member, MemberId};

/// A membership change submitted to the consensus layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    /// Add a voting member
    Add { peer_urls: Vec<String> },
    /// Add a non-voting member
    AddLearner { peer_urls: Vec<String> },
    /// Turn a learner into a voter
    Promote { id: MemberId },
    /// Remove a member
    Remove { id: MemberId },
    /// Replace a member's peer URLs
    UpdatePeerUrls { id: MemberId, peer_urls: Vec<String> },
}

impl MembershipChange {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            MembershipChange::Add { .. } => "add",
            MembershipChange::AddLearner { .. } => "add-learner",
            MembershipChange::Promote { .. } => "promote",
            MembershipChange::Remove { .. } => "remove",
            MembershipChange::UpdatePeerUrls { .. } => "update-peer-urls",
        }
    }
}

/// Acknowledgement of a durable membership change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipAck {
    /// The affected member as the store now records it
    pub member: Member,
}

/// Client-side view of the consensus store
#[async_trait::async_trait]
pub trait StoreTransport: Send + Sync {
    /// Query a single member's status
    async fn probe_status(&self, member: &Member, deadline: Instant) -> Result<StatusProbe>;

    /// Durably apply a membership change
    async fn submit_membership_change(
        &self,
        change: &MembershipChange,
        deadline: Instant,
    ) -> Result<MembershipAck>;

    /// Defragment a single member's storage
    async fn submit_defragment(&self, member: &Member, deadline: Instant) -> Result<()>;
}

/// Run a future, failing with `Error::Timeout` once `deadline` passes
pub async fn with_deadline<T, F>(deadline: Instant, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(what.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_with_deadline() {
        let deadline = Instant::now() + Duration::from_millis(20);
        let quick = with_deadline(deadline, "quick", async { Ok::<_, Error>(7) }).await;
        assert_eq!(quick.unwrap(), 7);

        let slow = with_deadline(deadline, "slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
        })
        .await;
        assert!(matches!(slow, Err(Error::Timeout(what)) if what == "slow"));
    }

    #[test]
    fn test_change_kind() {
        assert_eq!(MembershipChange::Remove { id: 3 }.kind(), "remove");
        assert_eq!(MembershipChange::AddLearner { peer_urls: vec![] }.kind(), "add-learner");
    }
}
