//! Cluster Health View
//!
//! Probes every member in parallel, classifies the results and partitions
//! the roster into healthy and unhealthy members.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::classifier::{HealthClassifier, HealthState};
use super::probe::{ProbeFailure, ProbeHistory, StatusProbe};
use crate::error::{Error, Result};
use crate::state::{quorum_size, Member, MemberId, MemberRegistry};
use crate::transport::StoreTransport;

/// Classification of one member
#[derive(Debug, Clone, Serialize)]
pub struct MemberHealth {
    pub member: Member,
    pub state: HealthState,
    pub probe: StatusProbe,
}

/// Cluster-wide health at one point in time
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealthSnapshot {
    /// Available members in roster order
    pub healthy: Vec<Member>,
    /// All other members in roster order
    pub unhealthy: Vec<Member>,
    /// Roster size when the snapshot was taken
    pub total: usize,
    /// Per-member classification in roster order
    pub members: Vec<MemberHealth>,
    /// Registry generation the snapshot was computed from
    pub generation: u64,
    pub taken_at: DateTime<Utc>,
}

impl ClusterHealthSnapshot {
    /// Build a snapshot from per-member classifications in roster order
    pub fn new(generation: u64, members: Vec<MemberHealth>) -> Self {
        let healthy = members
            .iter()
            .filter(|m| m.state.is_available())
            .map(|m| m.member.clone())
            .collect();
        let unhealthy = members
            .iter()
            .filter(|m| !m.state.is_available())
            .map(|m| m.member.clone())
            .collect();

        Self {
            healthy,
            unhealthy,
            total: members.len(),
            members,
            generation,
            taken_at: Utc::now(),
        }
    }

    /// Deterministic pick of a healthy member to issue requests through:
    /// the first Available member in roster order
    pub fn representative(&self) -> Option<&Member> {
        self.healthy.first()
    }

    /// Classification of a member, if it was part of the snapshot
    pub fn get(&self, id: MemberId) -> Option<&MemberHealth> {
        self.members.iter().find(|m| m.member.id == id)
    }

    /// Health state of a member, if it was part of the snapshot
    pub fn state_of(&self, id: MemberId) -> Option<HealthState> {
        self.get(id).map(|m| m.state)
    }

    /// Number of voting members
    pub fn voter_count(&self) -> usize {
        self.members.iter().filter(|m| m.member.is_voter()).count()
    }

    /// Number of Available voting members
    pub fn healthy_voter_count(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.member.is_voter() && m.state.is_available())
            .count()
    }

    /// Leader as reported by the reachable member with the highest term
    pub fn leader(&self) -> Option<MemberId> {
        self.members
            .iter()
            .filter(|m| m.probe.reachable())
            .max_by_key(|m| m.probe.raft_term)
            .and_then(|m| m.probe.leader)
    }

    /// Check that removing `removing` keeps the quorum invariant
    ///
    /// A removal commits under the current voting configuration, where the
    /// departing voter still votes on its own removal. Each removal
    /// therefore needs a majority of the voters at that point to be
    /// healthy. Several removals are applied one at a time, unhealthy
    /// members first, and must leave at least one healthy voter behind.
    /// Learners and ids outside the snapshot do not affect the verdict.
    pub fn check_quorum(&self, removing: &HashSet<MemberId>) -> Result<()> {
        let voters: Vec<&MemberHealth> =
            self.members.iter().filter(|m| m.member.is_voter()).collect();

        let mut departing: Vec<bool> = voters
            .iter()
            .filter(|m| removing.contains(&m.member.id))
            .map(|m| m.state.is_available())
            .collect();
        if departing.is_empty() {
            return Ok(());
        }
        // Unhealthy departures only shrink the quorum
        departing.sort_unstable();

        let mut remaining = voters.len();
        let mut healthy = voters.iter().filter(|m| m.state.is_available()).count();
        for departing_healthy in departing {
            let required = quorum_size(remaining);
            if healthy < required {
                return Err(Error::QuorumViolation { healthy, required });
            }
            remaining -= 1;
            if departing_healthy {
                healthy -= 1;
            }
        }

        if healthy == 0 {
            return Err(Error::QuorumViolation { healthy, required: 1 });
        }

        Ok(())
    }

    /// Whether removing `removing` keeps the quorum invariant
    pub fn is_quorum_safe(&self, removing: &HashSet<MemberId>) -> bool {
        self.check_quorum(removing).is_ok()
    }
}

/// Aggregated, cache-aware view of member health
pub struct ClusterHealthView {
    registry: Arc<MemberRegistry>,
    transport: Arc<dyn StoreTransport>,
    probe_timeout: Duration,
    /// Probe history per member, pruned to the current roster
    history: RwLock<HashMap<MemberId, ProbeHistory>>,
    /// Last snapshot taken
    last: RwLock<Option<ClusterHealthSnapshot>>,
}

impl ClusterHealthView {
    /// Create a new health view
    pub fn new(
        registry: Arc<MemberRegistry>,
        transport: Arc<dyn StoreTransport>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            probe_timeout,
            history: RwLock::new(HashMap::new()),
            last: RwLock::new(None),
        }
    }

    /// Probe and classify every member
    ///
    /// Individual probe failures and timeouts only degrade the affected
    /// member; the call itself fails only if `deadline` has already passed.
    pub async fn snapshot(&self, deadline: Instant) -> Result<ClusterHealthSnapshot> {
        if Instant::now() >= deadline {
            return Err(Error::Timeout("cluster health snapshot".into()));
        }

        let (generation, members) = self.registry.versioned_list().await;
        let probes = join_all(members.iter().map(|m| self.probe(m, deadline))).await;

        let classified = {
            let mut history = self.history.write().await;
            history.retain(|id, _| members.iter().any(|m| m.id == *id));

            members
                .into_iter()
                .zip(probes)
                .map(|(member, probe)| {
                    let entry = history.entry(member.id).or_default();
                    let state = HealthClassifier::classify(&member, &probe, entry);
                    entry.record(&probe);
                    MemberHealth { member, state, probe }
                })
                .collect()
        };

        let snapshot = ClusterHealthSnapshot::new(generation, classified);
        tracing::debug!(
            "health snapshot: {} healthy, {} unhealthy of {} members",
            snapshot.healthy.len(),
            snapshot.unhealthy.len(),
            snapshot.total
        );

        *self.last.write().await = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Last snapshot, unless the roster changed since it was taken
    pub async fn cached(&self) -> Option<ClusterHealthSnapshot> {
        let last = self.last.read().await;
        last.as_ref()
            .filter(|s| s.generation == self.registry.generation())
            .cloned()
    }

    /// Probe and classify a single member
    pub async fn check_member(&self, member: &Member, deadline: Instant) -> MemberHealth {
        let probe = self.probe(member, deadline).await;

        let mut history = self.history.write().await;
        let entry = history.entry(member.id).or_default();
        let state = HealthClassifier::classify(member, &probe, entry);
        entry.record(&probe);

        MemberHealth {
            member: member.clone(),
            state,
            probe,
        }
    }

    /// Take a fresh snapshot and check a hypothetical removal against it
    pub async fn is_quorum_safe(
        &self,
        removing: &HashSet<MemberId>,
        deadline: Instant,
    ) -> Result<bool> {
        Ok(self.snapshot(deadline).await?.is_quorum_safe(removing))
    }

    async fn probe(&self, member: &Member, deadline: Instant) -> StatusProbe {
        let probe_deadline = deadline.min(Instant::now() + self.probe_timeout);
        let result = tokio::time::timeout_at(
            probe_deadline,
            self.transport.probe_status(member, probe_deadline),
        )
        .await;

        match result {
            Ok(Ok(probe)) => probe,
            Ok(Err(Error::Timeout(_))) | Err(_) => {
                tracing::debug!("probe of {} timed out", member);
                StatusProbe::unreachable(member.id, ProbeFailure::Timeout)
            }
            Ok(Err(e)) => {
                tracing::debug!("probe of {} failed: {}", member, e);
                StatusProbe::unreachable(member.id, ProbeFailure::Transport(e.to_string()))
            }
        }
    }
}
