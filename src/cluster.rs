//! Cluster Manager
//!
//! Wires the registry, health view, mutator and maintenance coordinator
//! around one transport and one operation lock.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::WolfQuorumConfig;
use crate::error::Result;
use crate::health::{ClusterHealthSnapshot, ClusterHealthView, HealthState};
use crate::lock::OperationLock;
use crate::maintenance::{DefragReport, MaintenanceCoordinator};
use crate::membership::{MembershipMutator, MutationOutcome};
use crate::state::{Member, MemberId, MemberRegistry};
use crate::transport::StoreTransport;

/// Entry point for membership, health and maintenance of one cluster
pub struct ClusterManager {
    config: WolfQuorumConfig,
    registry: Arc<MemberRegistry>,
    health: Arc<ClusterHealthView>,
    mutator: MembershipMutator,
    maintenance: MaintenanceCoordinator,
}

impl ClusterManager {
    /// Create a manager for a cluster whose current roster is `members`
    pub fn new(
        config: WolfQuorumConfig,
        transport: Arc<dyn StoreTransport>,
        members: Vec<Member>,
    ) -> Result<Self> {
        config.validate()?;

        let size = members.len();
        let registry = Arc::new(MemberRegistry::with_members(members)?);
        let health = Arc::new(ClusterHealthView::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            config.health.probe_timeout(),
        ));
        let lock = OperationLock::new();

        let mutator = MembershipMutator::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&transport),
            lock.clone(),
        );
        let maintenance = MaintenanceCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            transport,
            lock,
            config.maintenance.clone(),
        );

        tracing::info!("cluster manager ready with {} members", size);

        Ok(Self {
            config,
            registry,
            health,
            mutator,
            maintenance,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &WolfQuorumConfig {
        &self.config
    }

    /// The member registry
    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    /// Current roster
    pub async fn list(&self) -> Vec<Member> {
        self.registry.list().await
    }

    /// Member by exact name
    pub async fn get(&self, name: &str) -> Result<Member> {
        self.registry.get(name).await
    }

    /// Probe and classify every member
    pub async fn snapshot(&self, deadline: Instant) -> Result<ClusterHealthSnapshot> {
        self.health.snapshot(deadline).await
    }

    /// Last snapshot, if the roster has not changed since
    pub async fn cached_snapshot(&self) -> Option<ClusterHealthSnapshot> {
        self.health.cached().await
    }

    /// Available members in roster order
    pub async fn healthy_members(&self, deadline: Instant) -> Result<Vec<Member>> {
        Ok(self.health.snapshot(deadline).await?.healthy)
    }

    /// Members that are not Available, in roster order
    pub async fn unhealthy_members(&self, deadline: Instant) -> Result<Vec<Member>> {
        Ok(self.health.snapshot(deadline).await?.unhealthy)
    }

    /// Health of a single member, by name
    pub async fn member_status(&self, name: &str, deadline: Instant) -> Result<HealthState> {
        let member = self.registry.get(name).await?;
        Ok(self.health.check_member(&member, deadline).await.state)
    }

    /// Whether removing `removing` would keep the quorum invariant
    pub async fn is_quorum_safe(&self, removing: &HashSet<MemberId>, deadline: Instant) -> Result<bool> {
        self.health.is_quorum_safe(removing, deadline).await
    }

    /// Add a voting member
    pub async fn add(&self, peer_url: &str, deadline: Instant) -> Result<MutationOutcome> {
        self.mutator.add(peer_url, deadline).await
    }

    /// Add a non-voting member
    pub async fn add_learner(&self, peer_url: &str, deadline: Instant) -> Result<MutationOutcome> {
        self.mutator.add_learner(peer_url, deadline).await
    }

    /// Promote a learner to a voting member
    pub async fn promote(&self, id: MemberId, deadline: Instant) -> Result<MutationOutcome> {
        self.mutator.promote(id, deadline).await
    }

    /// Remove a member
    pub async fn remove(&self, id: MemberId, deadline: Instant) -> Result<MutationOutcome> {
        self.mutator.remove(id, deadline).await
    }

    /// Replace a member's peer URLs
    pub async fn update_peer_urls(
        &self,
        id: MemberId,
        peer_urls: Vec<String>,
        deadline: Instant,
    ) -> Result<MutationOutcome> {
        self.mutator.update_peer_urls(id, peer_urls, deadline).await
    }

    /// Defragment every Available member, one at a time
    pub async fn defragment_all(&self, deadline: Instant) -> Result<DefragReport> {
        self.maintenance.defragment_all(deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::error::Error;
    use crate::membership::MutationStatus;
    use crate::state::quorum_size;
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

    fn test_config() -> WolfQuorumConfig {
        let mut config = WolfQuorumConfig::default();
        config.health.probe_timeout_ms = 100;
        config.maintenance.recovery_timeout_ms = 100;
        config.maintenance.recovery_poll_interval_ms = 10;
        config
    }

    async fn manager(store: FakeStore) -> (Arc<FakeStore>, ClusterManager) {
        let store = Arc::new(store);
        let members = store.members().await;
        let manager = ClusterManager::new(
            test_config(),
            Arc::clone(&store) as Arc<dyn StoreTransport>,
            members,
        )
        .unwrap();
        (store, manager)
    }

    fn five_with_two_down() -> FakeStore {
        FakeStore::builder()
            .members((1..=5).map(member))
            .probe(1, CannedProbe::Unreachable("connection refused".into()))
            .probe(2, CannedProbe::Unreachable("connection refused".into()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = test_config();
        config.health.probe_timeout_ms = 0;
        let store = Arc::new(FakeStore::builder().member(member(1)).build().unwrap());
        let result = ClusterManager::new(config, store, vec![member(1)]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_remove_stops_at_quorum() {
        let (_, manager) = manager(five_with_two_down()).await;

        let snapshot = manager.snapshot(deadline()).await.unwrap();
        assert_eq!(snapshot.healthy.len(), 3);
        assert_eq!(snapshot.unhealthy.len(), 2);
        assert_eq!(snapshot.representative().map(|m| m.id), Some(3));

        let outcome = manager.remove(5, deadline()).await.unwrap();
        assert_eq!(outcome.status, MutationStatus::Applied);
        assert_eq!(manager.list().await.len(), 4);

        let second = manager.remove(4, deadline()).await;
        assert!(matches!(
            second,
            Err(Error::QuorumViolation { healthy: 2, required: 3 })
        ));
        assert_eq!(manager.list().await.len(), 4);
    }

    #[tokio::test]
    async fn test_remove_retry_is_noop() {
        let (store, manager) = manager(five_with_two_down()).await;

        manager.remove(5, deadline()).await.unwrap();
        let retry = manager.remove(5, deadline()).await.unwrap();
        assert!(retry.is_noop());
        assert_eq!(retry.member.id, 5);
        assert_eq!(store.changes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_never_breaks_quorum() {
        for voters in 1..=7u64 {
            for healthy in 0..=voters {
                let mut builder = FakeStore::builder().members((1..=voters).map(member));
                for id in (healthy + 1)..=voters {
                    builder = builder.probe(id, CannedProbe::Unreachable("down".into()));
                }
                let (_, manager) = manager(builder.build().unwrap()).await;

                let result = manager.remove(1, deadline()).await;
                let expected = voters > 1 && healthy as usize >= quorum_size(voters as usize);
                assert_eq!(
                    result.is_ok(),
                    expected,
                    "{} voters, {} healthy: {:?}",
                    voters,
                    healthy,
                    result
                );
                if let Err(e) = result {
                    assert!(e.is_safety_violation());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_promote_waits_for_learner() {
        let (store, manager) = manager(FakeStore::builder().members((1..=3).map(member)).build().unwrap()).await;

        let learner = manager
            .add_learner("https://10.0.0.4:2380", deadline())
            .await
            .unwrap()
            .member;
        assert!(!learner.is_started());

        let early = manager.promote(learner.id, deadline()).await;
        assert!(matches!(early, Err(Error::NotReady(_))));
        assert!(manager.registry().get_by_id(learner.id).await.unwrap().is_learner);

        store
            .start_member(learner.id, "etcd-4", "https://10.0.0.4:2379")
            .await
            .unwrap();
        let promoted = manager.promote(learner.id, deadline()).await.unwrap();
        assert!(promoted.member.is_voter());
        assert_eq!(manager.get("etcd-4").await.unwrap().id, learner.id);
        assert_eq!(
            manager.member_status("etcd-4", deadline()).await.unwrap(),
            HealthState::Available
        );
    }

    #[tokio::test]
    async fn test_member_status_and_buckets() {
        let (_, manager) = manager(five_with_two_down()).await;

        assert_eq!(
            manager.member_status("etcd-1", deadline()).await.unwrap(),
            HealthState::Unknown
        );
        assert!(matches!(
            manager.member_status("etcd-9", deadline()).await,
            Err(Error::MemberNotFound(_))
        ));

        let healthy: Vec<_> = manager
            .healthy_members(deadline())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(healthy, vec![3, 4, 5]);
        assert_eq!(manager.unhealthy_members(deadline()).await.unwrap().len(), 2);

        assert!(manager.is_quorum_safe(&HashSet::from([3]), deadline()).await.unwrap());
        assert!(!manager.is_quorum_safe(&HashSet::from([3, 4]), deadline()).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_defragment_and_remove_are_serialized() {
        let store = FakeStore::builder()
            .members((1..=3).map(member))
            .defrag_delay(Duration::from_millis(20))
            .build()
            .unwrap();
        let (store, manager) = manager(store).await;
        let manager = Arc::new(manager);

        let first = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.defragment_all(deadline()).await })
        };
        let second = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.defragment_all(deadline()).await })
        };

        assert!(first.await.unwrap().unwrap().is_complete_success());
        assert!(second.await.unwrap().unwrap().is_complete_success());
        assert_eq!(store.max_concurrent_defrags(), 1);

        manager.remove(3, deadline()).await.unwrap();
        assert!(manager.cached_snapshot().await.is_none());
    }
}
