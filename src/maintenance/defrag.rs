//! Rolling Defragmentation
//!
//! Defragments members one at a time. Each member must report Available
//! again before the next one is touched; the leader goes last.

use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::MaintenanceConfig;
use crate::error::Result;
use crate::health::{ClusterHealthSnapshot, ClusterHealthView, HealthState, MemberHealth};
use crate::lock::OperationLock;
use crate::state::{Member, MemberRegistry};
use crate::transport::{with_deadline, StoreTransport};

/// Why a member was left alone
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SkipReason {
    /// The member was not Available when re-checked at its turn
    Unhealthy(HealthState),
    /// Not enough reclaimable space to be worth it
    BelowThreshold { fragmented_bytes: u64, fragmented_percentage: f64 },
    /// The run's deadline passed before the member's turn
    DeadlineExceeded,
    /// An earlier member did not come back after defragmentation
    PreviousMemberNotRecovered,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Unhealthy(state) => write!(f, "member is {}", state),
            SkipReason::BelowThreshold {
                fragmented_bytes,
                fragmented_percentage,
            } => write!(
                f,
                "only {} bytes ({:.1}%) fragmented",
                fragmented_bytes, fragmented_percentage
            ),
            SkipReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            SkipReason::PreviousMemberNotRecovered => write!(f, "previous member did not recover"),
        }
    }
}

/// What happened to one member
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DefragOutcome {
    Defragmented { reclaimed_bytes: u64 },
    Skipped { reason: SkipReason },
    Failed { reason: String },
}

/// Per-member entry of a [`DefragReport`]
#[derive(Debug, Clone, Serialize)]
pub struct MemberDefrag {
    pub member: Member,
    pub outcome: DefragOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Result of a rolling defragmentation, in the order members were visited
#[derive(Debug, Clone, Serialize)]
pub struct DefragReport {
    pub operation_id: Uuid,
    pub outcomes: Vec<MemberDefrag>,
}

impl DefragReport {
    /// Members that were defragmented and came back
    pub fn succeeded(&self) -> impl Iterator<Item = &MemberDefrag> {
        self.outcomes
            .iter()
            .filter(|m| matches!(m.outcome, DefragOutcome::Defragmented { .. }))
    }

    /// Members whose defragmentation failed or who did not come back
    pub fn failed(&self) -> impl Iterator<Item = &MemberDefrag> {
        self.outcomes
            .iter()
            .filter(|m| matches!(m.outcome, DefragOutcome::Failed { .. }))
    }

    /// Members that were left alone
    pub fn skipped(&self) -> impl Iterator<Item = &MemberDefrag> {
        self.outcomes
            .iter()
            .filter(|m| matches!(m.outcome, DefragOutcome::Skipped { .. }))
    }

    /// At least one member was defragmented
    pub fn is_partial_success(&self) -> bool {
        self.succeeded().next().is_some()
    }

    /// Every member was defragmented
    pub fn is_complete_success(&self) -> bool {
        !self.outcomes.is_empty() && self.succeeded().count() == self.outcomes.len()
    }
}

/// Runs maintenance across the cluster under the operation lock
pub struct MaintenanceCoordinator {
    registry: Arc<MemberRegistry>,
    health: Arc<ClusterHealthView>,
    transport: Arc<dyn StoreTransport>,
    lock: OperationLock,
    config: MaintenanceConfig,
}

impl MaintenanceCoordinator {
    /// Create a new coordinator
    pub fn new(
        registry: Arc<MemberRegistry>,
        health: Arc<ClusterHealthView>,
        transport: Arc<dyn StoreTransport>,
        lock: OperationLock,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            registry,
            health,
            transport,
            lock,
            config,
        }
    }

    /// Defragment every Available member, one at a time
    ///
    /// Only failing to take the operation lock before `deadline` is fatal.
    /// Everything else is reported per member.
    pub async fn defragment_all(&self, deadline: Instant) -> Result<DefragReport> {
        let _guard = self.lock.acquire_until(deadline, "defragment").await?;
        let operation_id = Uuid::new_v4();
        tracing::info!("[{}] starting rolling defragmentation", operation_id);

        let snapshot = match self.health.snapshot(deadline).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("[{}] cannot assess cluster health: {}", operation_id, e);
                let now = Utc::now();
                let outcomes = self
                    .registry
                    .list()
                    .await
                    .into_iter()
                    .map(|member| MemberDefrag {
                        member,
                        outcome: DefragOutcome::Skipped {
                            reason: SkipReason::DeadlineExceeded,
                        },
                        started_at: now,
                        finished_at: now,
                    })
                    .collect();
                return Ok(DefragReport { operation_id, outcomes });
            }
        };

        let mut outcomes = Vec::with_capacity(snapshot.total);
        let mut halted = false;

        for entry in visit_order(&snapshot) {
            let started_at = Utc::now();
            let outcome = if halted {
                DefragOutcome::Skipped {
                    reason: SkipReason::PreviousMemberNotRecovered,
                }
            } else if Instant::now() >= deadline {
                DefragOutcome::Skipped {
                    reason: SkipReason::DeadlineExceeded,
                }
            } else {
                let (outcome, recovered) = self.visit(&entry.member, deadline).await;
                halted = !recovered;
                outcome
            };

            match &outcome {
                DefragOutcome::Defragmented { reclaimed_bytes } => tracing::info!(
                    "[{}] defragmented {}, reclaimed {} bytes",
                    operation_id,
                    entry.member,
                    reclaimed_bytes
                ),
                DefragOutcome::Skipped { reason } => {
                    tracing::warn!("[{}] skipped {}: {}", operation_id, entry.member, reason)
                }
                DefragOutcome::Failed { reason } => {
                    tracing::warn!("[{}] failed {}: {}", operation_id, entry.member, reason)
                }
            }

            outcomes.push(MemberDefrag {
                member: entry.member.clone(),
                outcome,
                started_at,
                finished_at: Utc::now(),
            });
        }

        let report = DefragReport { operation_id, outcomes };
        tracing::info!(
            "[{}] rolling defragmentation done: {} succeeded, {} failed, {} skipped",
            operation_id,
            report.succeeded().count(),
            report.failed().count(),
            report.skipped().count()
        );
        Ok(report)
    }

    /// Re-classify a member and defragment it unless it must be skipped
    ///
    /// The opening snapshot can be stale by the time a member's turn comes,
    /// so the decision is made on a fresh probe. Returns the outcome and
    /// whether the run may continue.
    async fn visit(&self, member: &Member, deadline: Instant) -> (DefragOutcome, bool) {
        let current = self.health.check_member(member, deadline).await;
        match self.skip_reason(&current) {
            Some(reason) => (DefragOutcome::Skipped { reason }, true),
            None => self.defragment_member(&current, deadline).await,
        }
    }

    fn skip_reason(&self, entry: &MemberHealth) -> Option<SkipReason> {
        if !entry.state.is_available() {
            return Some(SkipReason::Unhealthy(entry.state));
        }

        let fragmented_bytes = entry.probe.fragmented_bytes();
        let fragmented_percentage = entry.probe.fragmented_percentage();
        if fragmented_bytes < self.config.min_defrag_bytes
            || fragmented_percentage < self.config.max_fragmented_percentage
        {
            return Some(SkipReason::BelowThreshold {
                fragmented_bytes,
                fragmented_percentage,
            });
        }

        None
    }

    /// Defragment one member and wait for it to come back
    ///
    /// Returns the outcome and whether the member recovered.
    async fn defragment_member(&self, entry: &MemberHealth, deadline: Instant) -> (DefragOutcome, bool) {
        let member = &entry.member;
        tracing::debug!("defragmenting {}", member);

        let what = format!("defragment {}", member);
        let submitted =
            with_deadline(deadline, &what, self.transport.submit_defragment(member, deadline)).await;

        let recovered = self.await_recovery(member, deadline).await;

        match (submitted, recovered) {
            (Ok(()), Some(after)) => (
                DefragOutcome::Defragmented {
                    reclaimed_bytes: entry.probe.db_size.saturating_sub(after.probe.db_size),
                },
                true,
            ),
            (Ok(()), None) => (
                DefragOutcome::Failed {
                    reason: "did not report Available after defragmentation".into(),
                },
                false,
            ),
            (Err(e), recovered) => (
                DefragOutcome::Failed {
                    reason: e.to_string(),
                },
                recovered.is_some(),
            ),
        }
    }

    /// Poll a member until it reports Available, within the recovery timeout
    async fn await_recovery(&self, member: &Member, deadline: Instant) -> Option<MemberHealth> {
        let until = deadline.min(Instant::now() + self.config.recovery_timeout());
        let interval = self.config.recovery_poll_interval();

        loop {
            let health = self.health.check_member(member, until).await;
            if health.state.is_available() {
                return Some(health);
            }

            let next = Instant::now() + interval;
            if next >= until {
                tracing::debug!("{} still {} at recovery deadline", member, health.state);
                return None;
            }
            tokio::time::sleep_until(next).await;
        }
    }
}

/// Roster order, with the leader moved to the end
fn visit_order(snapshot: &ClusterHealthSnapshot) -> Vec<&MemberHealth> {
    let leader = snapshot.leader();
    let (mut order, last): (Vec<&MemberHealth>, Vec<&MemberHealth>) = snapshot
        .members
        .iter()
        .partition(|m| Some(m.member.id) != leader);
    order.extend(last);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::error::Error;
    use crate::state::MemberId;
    use crate::transport::fake::{CannedProbe, FakeStore};

    fn member(id: MemberId) -> Member {
        Member::voter(
            id,
            format!("etcd-{}", id),
            format!("https://10.0.0.{}:2380", id),
            format!("https://10.0.0.{}:2379", id),
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn fast_recovery() -> MaintenanceConfig {
        MaintenanceConfig {
            recovery_timeout_ms: 60,
            recovery_poll_interval_ms: 10,
            ..Default::default()
        }
    }

    struct Harness {
        store: Arc<FakeStore>,
        lock: OperationLock,
        coordinator: Arc<MaintenanceCoordinator>,
    }

    async fn harness(store: FakeStore, config: MaintenanceConfig) -> Harness {
        let store = Arc::new(store);
        let transport: Arc<dyn StoreTransport> = Arc::clone(&store) as Arc<dyn StoreTransport>;
        let registry = Arc::new(MemberRegistry::with_members(store.members().await).unwrap());
        let health = Arc::new(ClusterHealthView::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Duration::from_millis(50),
        ));
        let lock = OperationLock::new();
        let coordinator = Arc::new(MaintenanceCoordinator::new(
            registry,
            health,
            transport,
            lock.clone(),
            config,
        ));
        Harness { store, lock, coordinator }
    }

    fn outcome_of(report: &DefragReport, id: MemberId) -> &DefragOutcome {
        &report
            .outcomes
            .iter()
            .find(|m| m.member.id == id)
            .unwrap()
            .outcome
    }

    #[tokio::test]
    async fn test_defragments_every_member_and_reclaims_space() {
        let store = FakeStore::builder()
            .members((1..=3).map(member))
            .db_size(1, 1000, 400)
            .db_size(2, 500, 500)
            .build()
            .unwrap();
        let h = harness(store, fast_recovery()).await;

        let report = h.coordinator.defragment_all(deadline()).await.unwrap();
        assert!(report.is_complete_success());
        assert_eq!(
            outcome_of(&report, 1),
            &DefragOutcome::Defragmented { reclaimed_bytes: 600 }
        );
        assert_eq!(
            outcome_of(&report, 2),
            &DefragOutcome::Defragmented { reclaimed_bytes: 0 }
        );
        assert_eq!(h.store.defrags().await.len(), 3);
        assert!(!h.lock.is_held());
    }

    #[tokio::test]
    async fn test_concurrent_runs_never_overlap() {
        let store = FakeStore::builder()
            .members((1..=3).map(member))
            .defrag_delay(Duration::from_millis(20))
            .build()
            .unwrap();
        let h = harness(store, fast_recovery()).await;

        let runs: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = Arc::clone(&h.coordinator);
                tokio::spawn(async move { coordinator.defragment_all(deadline()).await })
            })
            .collect();
        for run in runs {
            assert!(run.await.unwrap().unwrap().is_complete_success());
        }

        assert_eq!(h.store.max_concurrent_defrags(), 1);
        let mut records = h.store.defrags().await;
        assert_eq!(records.len(), 9);
        records.sort_by_key(|r| r.started);
        for pair in records.windows(2) {
            assert!(pair[1].started >= pair[0].finished);
        }
    }

    #[tokio::test]
    async fn test_unhealthy_members_are_skipped() {
        let store = FakeStore::builder()
            .members((1..=3).map(member))
            .probe(2, CannedProbe::Unreachable("connection refused".into()))
            .probe(3, CannedProbe::Alarmed(vec!["NOSPACE".into()]))
            .build()
            .unwrap();
        let h = harness(store, fast_recovery()).await;

        let report = h.coordinator.defragment_all(deadline()).await.unwrap();
        assert!(report.is_partial_success());
        assert!(!report.is_complete_success());
        assert_eq!(
            outcome_of(&report, 2),
            &DefragOutcome::Skipped {
                reason: SkipReason::Unhealthy(HealthState::Unknown)
            }
        );
        assert_eq!(
            outcome_of(&report, 3),
            &DefragOutcome::Skipped {
                reason: SkipReason::Unhealthy(HealthState::Unhealthy)
            }
        );
        assert_eq!(report.failed().count(), 0);

        let touched: Vec<_> = h.store.defrags().await.iter().map(|r| r.member_id).collect();
        assert_eq!(touched, vec![1]);
    }

    #[tokio::test]
    async fn test_member_failing_mid_run_is_skipped() {
        let store = FakeStore::builder()
            .members((1..=3).map(member))
            .defrag_delay(Duration::from_millis(50))
            .build()
            .unwrap();
        let h = harness(store, fast_recovery()).await;

        let store = Arc::clone(&h.store);
        let outage = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store
                .set_probe(3, CannedProbe::Unreachable("connection refused".into()))
                .await
                .unwrap();
        });

        let report = h.coordinator.defragment_all(deadline()).await.unwrap();
        outage.await.unwrap();

        assert_eq!(
            outcome_of(&report, 3),
            &DefragOutcome::Skipped {
                reason: SkipReason::Unhealthy(HealthState::Unhealthy)
            }
        );
        assert_eq!(report.succeeded().count(), 2);
        assert_eq!(report.failed().count(), 0);

        let touched: Vec<_> = h.store.defrags().await.iter().map(|r| r.member_id).collect();
        assert_eq!(touched, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_report_serializes_to_json() {
        let store = FakeStore::builder()
            .members((1..=2).map(member))
            .db_size(1, 1000, 400)
            .probe(2, CannedProbe::Alarmed(vec!["NOSPACE".into()]))
            .build()
            .unwrap();
        let h = harness(store, fast_recovery()).await;

        let report = h.coordinator.defragment_all(deadline()).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["operation_id"], report.operation_id.to_string());
        assert_eq!(json["outcomes"][0]["member"]["name"], "etcd-1");
        assert_eq!(json["outcomes"][0]["outcome"]["Defragmented"]["reclaimed_bytes"], 600);
        assert_eq!(
            json["outcomes"][1]["outcome"]["Skipped"]["reason"]["Unhealthy"],
            "Unhealthy"
        );
    }

    #[tokio::test]
    async fn test_members_below_threshold_are_skipped() {
        let store = FakeStore::builder()
            .members((1..=2).map(member))
            .db_size(1, 1000, 100)
            .db_size(2, 1000, 950)
            .build()
            .unwrap();
        let config = MaintenanceConfig {
            min_defrag_bytes: 100,
            max_fragmented_percentage: 10.0,
            ..fast_recovery()
        };
        let h = harness(store, config).await;

        let report = h.coordinator.defragment_all(deadline()).await.unwrap();
        assert!(matches!(
            outcome_of(&report, 1),
            DefragOutcome::Defragmented { reclaimed_bytes: 900 }
        ));
        assert!(matches!(
            outcome_of(&report, 2),
            DefragOutcome::Skipped {
                reason: SkipReason::BelowThreshold { fragmented_bytes: 50, .. }
            }
        ));
    }

    #[tokio::test]
    async fn test_leader_goes_last() {
        let store = FakeStore::builder()
            .members((1..=3).map(member))
            .leader(1)
            .build()
            .unwrap();
        let h = harness(store, fast_recovery()).await;

        let report = h.coordinator.defragment_all(deadline()).await.unwrap();
        let visited: Vec<_> = report.outcomes.iter().map(|m| m.member.id).collect();
        assert_eq!(visited, vec![2, 3, 1]);

        let touched: Vec<_> = h.store.defrags().await.iter().map(|r| r.member_id).collect();
        assert_eq!(touched, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_failed_member_does_not_stop_the_run() {
        let store = FakeStore::builder().members((1..=3).map(member)).build().unwrap();
        let h = harness(store, fast_recovery()).await;
        h.store.fail_defrag(2).await;

        let report = h.coordinator.defragment_all(deadline()).await.unwrap();
        assert!(matches!(outcome_of(&report, 2), DefragOutcome::Failed { .. }));
        assert!(matches!(outcome_of(&report, 3), DefragOutcome::Defragmented { .. }));
        assert_eq!(report.succeeded().count(), 2);
        assert!(report.is_partial_success());
    }

    #[tokio::test]
    async fn test_unrecovered_member_halts_the_run() {
        let store = FakeStore::builder().members((1..=3).map(member)).build().unwrap();
        let h = harness(store, fast_recovery()).await;
        h.store.go_down_after_defrag(1).await;

        let report = h.coordinator.defragment_all(deadline()).await.unwrap();
        assert!(matches!(outcome_of(&report, 1), DefragOutcome::Failed { .. }));
        for id in [2, 3] {
            assert_eq!(
                outcome_of(&report, id),
                &DefragOutcome::Skipped {
                    reason: SkipReason::PreviousMemberNotRecovered
                }
            );
        }
        assert!(!report.is_partial_success());
        assert_eq!(h.store.defrags().await.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_timeout_is_fatal() {
        let store = FakeStore::builder().members((1..=3).map(member)).build().unwrap();
        let h = harness(store, fast_recovery()).await;

        let guard = h.lock.acquire().await;
        let result = h
            .coordinator
            .defragment_all(Instant::now() + Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(h.store.defrags().await.is_empty());
        drop(guard);
    }
}
