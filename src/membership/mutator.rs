//! Membership Mutator
//!
//! Adds, promotes, removes and re-addresses members. Every operation runs
//! under the cluster operation lock, evaluates its safety precondition
//! against a fresh health snapshot and only then submits the change.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout_at, Instant};

use super::operation::{MutationKind, MutationOutcome, MutationStatus, Operation, OperationState};
use crate::error::{Error, Result};
use crate::health::ClusterHealthView;
use crate::lock::OperationLock;
use crate::state::{quorum_size, Member, MemberId, MemberRegistry};
use crate::transport::{MembershipChange, StoreTransport};

/// Quorum-guarded membership changes
pub struct MembershipMutator {
    registry: Arc<MemberRegistry>,
    health: Arc<ClusterHealthView>,
    transport: Arc<dyn StoreTransport>,
    lock: OperationLock,
    /// Members removed through this mutator, so retries can be recognized
    removed: RwLock<HashMap<MemberId, Member>>,
}

impl MembershipMutator {
    /// Create a new mutator
    pub fn new(
        registry: Arc<MemberRegistry>,
        health: Arc<ClusterHealthView>,
        transport: Arc<dyn StoreTransport>,
        lock: OperationLock,
    ) -> Self {
        Self {
            registry,
            health,
            transport,
            lock,
            removed: RwLock::new(HashMap::new()),
        }
    }

    /// Add a voting member
    ///
    /// The new voter has not started yet, so the healthy voters must
    /// already form a quorum of the enlarged cluster.
    pub async fn add(&self, peer_url: &str, deadline: Instant) -> Result<MutationOutcome> {
        let mut op = Operation::propose(MutationKind::Add, peer_url);
        let result = timeout_at(deadline, self.add_locked(&mut op, peer_url, deadline)).await;
        op.conclude(result)
    }

    async fn add_locked(
        &self,
        op: &mut Operation,
        peer_url: &str,
        deadline: Instant,
    ) -> Result<(MutationStatus, Member)> {
        let _guard = self.lock.acquire().await;
        self.ensure_peer_url_free(peer_url, None).await?;

        let snapshot = self.health.snapshot(deadline).await?;
        let healthy = snapshot.healthy_voter_count();
        let required = quorum_size(snapshot.voter_count() + 1);
        if healthy < required {
            return Err(Error::QuorumViolation { healthy, required });
        }
        op.advance(OperationState::QuorumChecked);

        let change = MembershipChange::Add {
            peer_urls: vec![peer_url.to_string()],
        };
        let ack = self.transport.submit_membership_change(&change, deadline).await?;
        self.registry.add(ack.member.clone()).await?;
        Ok((MutationStatus::Applied, ack.member))
    }

    /// Add a non-voting member
    ///
    /// Learners do not count toward quorum, so no quorum check is needed.
    pub async fn add_learner(&self, peer_url: &str, deadline: Instant) -> Result<MutationOutcome> {
        let op = Operation::propose(MutationKind::AddLearner, peer_url);
        let result = timeout_at(deadline, self.add_learner_locked(peer_url, deadline)).await;
        op.conclude(result)
    }

    async fn add_learner_locked(
        &self,
        peer_url: &str,
        deadline: Instant,
    ) -> Result<(MutationStatus, Member)> {
        let _guard = self.lock.acquire().await;
        self.ensure_peer_url_free(peer_url, None).await?;

        let change = MembershipChange::AddLearner {
            peer_urls: vec![peer_url.to_string()],
        };
        let ack = self.transport.submit_membership_change(&change, deadline).await?;
        let mut learner = ack.member;
        learner.is_learner = true;
        self.registry.add(learner.clone()).await?;
        Ok((MutationStatus::Applied, learner))
    }

    /// Promote a learner to a voting member
    ///
    /// The learner must have caught up and be reporting Available.
    pub async fn promote(&self, id: MemberId, deadline: Instant) -> Result<MutationOutcome> {
        let mut op = Operation::propose(MutationKind::Promote, format!("{:x}", id));
        let result = timeout_at(deadline, self.promote_locked(&mut op, id, deadline)).await;
        op.conclude(result)
    }

    async fn promote_locked(
        &self,
        op: &mut Operation,
        id: MemberId,
        deadline: Instant,
    ) -> Result<(MutationStatus, Member)> {
        let _guard = self.lock.acquire().await;
        let member = self.registry.get_by_id(id).await?;
        if member.is_voter() {
            return Ok((MutationStatus::NoOp, member));
        }

        let snapshot = self.health.snapshot(deadline).await?;
        match snapshot.state_of(id) {
            Some(state) if state.is_available() => {}
            Some(state) => {
                return Err(Error::NotReady(format!("learner {} is {}", member, state)));
            }
            None => return Err(Error::MemberNotFound(format!("{:x}", id))),
        }
        // Promotion only adds a voter that is already healthy
        op.advance(OperationState::QuorumChecked);

        let change = MembershipChange::Promote { id };
        let ack = self.transport.submit_membership_change(&change, deadline).await?;
        let mut record = ack.member;
        record.is_learner = false;
        let promoted = self.registry.refresh(record).await?;
        Ok((MutationStatus::Applied, promoted))
    }

    /// Remove a member
    ///
    /// Removing a member that this mutator already removed succeeds as a
    /// no-op, so callers can retry after an ambiguous failure.
    pub async fn remove(&self, id: MemberId, deadline: Instant) -> Result<MutationOutcome> {
        let mut op = Operation::propose(MutationKind::Remove, format!("{:x}", id));
        let result = timeout_at(deadline, self.remove_locked(&mut op, id, deadline)).await;
        op.conclude(result)
    }

    async fn remove_locked(
        &self,
        op: &mut Operation,
        id: MemberId,
        deadline: Instant,
    ) -> Result<(MutationStatus, Member)> {
        let _guard = self.lock.acquire().await;
        let member = match self.registry.get_by_id(id).await {
            Ok(member) => member,
            Err(e) => {
                return match self.removed.read().await.get(&id) {
                    Some(gone) => Ok((MutationStatus::NoOp, gone.clone())),
                    None => Err(e),
                };
            }
        };

        let snapshot = self.health.snapshot(deadline).await?;
        snapshot.check_quorum(&HashSet::from([id]))?;
        op.advance(OperationState::QuorumChecked);

        let change = MembershipChange::Remove { id };
        let status = match self.transport.submit_membership_change(&change, deadline).await {
            Ok(_) => MutationStatus::Applied,
            // An earlier attempt reached the store but its ack was lost
            Err(Error::MemberNotFound(_)) => MutationStatus::NoOp,
            Err(e) => return Err(e),
        };

        // Tombstone first: a cancellation between the two steps must leave a
        // retry that still resolves to NoOp
        self.removed.write().await.insert(id, member);
        let removed = self.registry.remove(id).await?;
        Ok((status, removed))
    }

    /// Replace a member's peer URLs
    pub async fn update_peer_urls(
        &self,
        id: MemberId,
        peer_urls: Vec<String>,
        deadline: Instant,
    ) -> Result<MutationOutcome> {
        let op = Operation::propose(MutationKind::UpdatePeerUrls, format!("{:x}", id));
        let result = timeout_at(deadline, self.update_peer_urls_locked(id, peer_urls, deadline)).await;
        op.conclude(result)
    }

    async fn update_peer_urls_locked(
        &self,
        id: MemberId,
        peer_urls: Vec<String>,
        deadline: Instant,
    ) -> Result<(MutationStatus, Member)> {
        let _guard = self.lock.acquire().await;
        let member = self.registry.get_by_id(id).await?;
        if member.peer_urls == peer_urls {
            return Ok((MutationStatus::NoOp, member));
        }
        for url in &peer_urls {
            self.ensure_peer_url_free(url, Some(id)).await?;
        }

        let change = MembershipChange::UpdatePeerUrls {
            id,
            peer_urls: peer_urls.clone(),
        };
        self.transport.submit_membership_change(&change, deadline).await?;
        let updated = self.registry.update_peer_urls(id, peer_urls).await?;
        Ok((MutationStatus::Applied, updated))
    }

    async fn ensure_peer_url_free(&self, peer_url: &str, owner: Option<MemberId>) -> Result<()> {
        match self.registry.find_by_peer_url(peer_url).await {
            Some(existing) if Some(existing.id) != owner => Err(Error::Conflict(format!(
                "peer URL {} already registered to {}",
                peer_url, existing
            ))),
            _ => Ok(()),
        }
    }
}
