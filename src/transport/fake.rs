//! In-memory Store Transport
//!
//! A deterministic stand-in for a consensus store. Each member answers
//! probes with a canned response; membership changes and defragmentations
//! are applied to an in-memory roster and recorded for inspection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{MembershipAck, MembershipChange, StoreTransport};
use crate::error::{Error, Result};
use crate::health::{ProbeFailure, StatusProbe};
use crate::state::{Member, MemberId};

/// First id handed out to members added through the fake
const FIRST_ASSIGNED_ID: MemberId = 0x1000;

/// How a member answers status probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CannedProbe {
    /// Reachable, no alarms
    Healthy,
    /// Reachable, reporting alarms
    Alarmed(Vec<String>),
    /// The transport cannot reach the member
    Unreachable(String),
    /// Never answers; the caller's deadline fires first
    Hang,
}

/// A completed defragmentation
#[derive(Debug, Clone, Copy)]
pub struct DefragRecord {
    pub member_id: MemberId,
    pub started: Instant,
    pub finished: Instant,
}

struct FakeMember {
    member: Member,
    probe: CannedProbe,
    db_size: u64,
    db_size_in_use: u64,
}

struct FakeInner {
    members: Vec<FakeMember>,
    leader: Option<MemberId>,
    next_id: MemberId,
    changes: Vec<MembershipChange>,
    defrags: Vec<DefragRecord>,
    fail_next_change: Option<String>,
    failing_defrags: HashSet<MemberId>,
    down_after_defrag: HashSet<MemberId>,
}

/// In-memory consensus store
pub struct FakeStore {
    inner: Mutex<FakeInner>,
    defrag_delay: Duration,
    defrags_in_flight: AtomicUsize,
    max_defrags_in_flight: AtomicUsize,
    probe_count: AtomicUsize,
}

/// Builder for [`FakeStore`], validated once in [`FakeStoreBuilder::build`]
#[derive(Default)]
pub struct FakeStoreBuilder {
    members: Vec<Member>,
    probes: HashMap<MemberId, CannedProbe>,
    db_sizes: HashMap<MemberId, (u64, u64)>,
    leader: Option<MemberId>,
    defrag_delay: Duration,
}

impl FakeStoreBuilder {
    /// Add a member to the initial roster
    pub fn member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    /// Add several members to the initial roster
    pub fn members(mut self, members: impl IntoIterator<Item = Member>) -> Self {
        self.members.extend(members);
        self
    }

    /// Set how a member answers probes
    pub fn probe(mut self, id: MemberId, probe: CannedProbe) -> Self {
        self.probes.insert(id, probe);
        self
    }

    /// Set a member's reported database sizes
    pub fn db_size(mut self, id: MemberId, db_size: u64, db_size_in_use: u64) -> Self {
        self.db_sizes.insert(id, (db_size, db_size_in_use));
        self
    }

    /// Set the member every reachable member reports as leader
    pub fn leader(mut self, id: MemberId) -> Self {
        self.leader = Some(id);
        self
    }

    /// Make each defragmentation take this long
    pub fn defrag_delay(mut self, delay: Duration) -> Self {
        self.defrag_delay = delay;
        self
    }

    /// Validate and build the store
    pub fn build(self) -> Result<FakeStore> {
        let mut ids = HashSet::new();
        for member in &self.members {
            if !ids.insert(member.id) {
                return Err(Error::Config(format!("duplicate fake member id {:x}", member.id)));
            }
        }

        let unknown = self
            .probes
            .keys()
            .chain(self.db_sizes.keys())
            .chain(self.leader.iter())
            .find(|id| !ids.contains(*id));
        if let Some(id) = unknown {
            return Err(Error::Config(format!("canned data for unknown member {:x}", id)));
        }

        if let Some((id, _)) = self.db_sizes.iter().find(|(_, (size, in_use))| in_use > size) {
            return Err(Error::Config(format!(
                "member {:x}: db_size_in_use exceeds db_size",
                id
            )));
        }

        let mut probes = self.probes;
        let mut db_sizes = self.db_sizes;
        let next_id = self
            .members
            .iter()
            .map(|m| m.id + 1)
            .max()
            .unwrap_or(0)
            .max(FIRST_ASSIGNED_ID);

        let members = self
            .members
            .into_iter()
            .map(|member| {
                let probe = probes
                    .remove(&member.id)
                    .unwrap_or_else(|| default_probe(&member));
                let (db_size, db_size_in_use) = db_sizes.remove(&member.id).unwrap_or((0, 0));
                FakeMember {
                    member,
                    probe,
                    db_size,
                    db_size_in_use,
                }
            })
            .collect();

        Ok(FakeStore {
            inner: Mutex::new(FakeInner {
                members,
                leader: self.leader,
                next_id,
                changes: Vec::new(),
                defrags: Vec::new(),
                fail_next_change: None,
                failing_defrags: HashSet::new(),
                down_after_defrag: HashSet::new(),
            }),
            defrag_delay: self.defrag_delay,
            defrags_in_flight: AtomicUsize::new(0),
            max_defrags_in_flight: AtomicUsize::new(0),
            probe_count: AtomicUsize::new(0),
        })
    }
}

/// Members that never started cannot answer
fn default_probe(member: &Member) -> CannedProbe {
    if member.is_started() {
        CannedProbe::Healthy
    } else {
        CannedProbe::Unreachable("member has not started".into())
    }
}

impl FakeStore {
    /// Start building a fake store
    pub fn builder() -> FakeStoreBuilder {
        FakeStoreBuilder::default()
    }

    /// Current roster as the store sees it
    pub async fn members(&self) -> Vec<Member> {
        let inner = self.inner.lock().await;
        inner.members.iter().map(|m| m.member.clone()).collect()
    }

    /// Change how a member answers probes
    pub async fn set_probe(&self, id: MemberId, probe: CannedProbe) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let entry = inner.find_mut(id)?;
        entry.probe = probe;
        Ok(())
    }

    /// Mark a member as started, publishing its name and client URL
    pub async fn start_member(&self, id: MemberId, name: &str, client_url: &str) -> Result<Member> {
        let mut inner = self.inner.lock().await;
        let entry = inner.find_mut(id)?;
        entry.member.name = name.to_string();
        entry.member.client_urls = vec![client_url.to_string()];
        entry.probe = CannedProbe::Healthy;
        Ok(entry.member.clone())
    }

    /// Fail the next membership change with a transport error
    pub async fn fail_next_change(&self, reason: &str) {
        self.inner.lock().await.fail_next_change = Some(reason.to_string());
    }

    /// Fail every defragmentation of a member
    pub async fn fail_defrag(&self, id: MemberId) {
        self.inner.lock().await.failing_defrags.insert(id);
    }

    /// Make a member unreachable once it has been defragmented
    pub async fn go_down_after_defrag(&self, id: MemberId) {
        self.inner.lock().await.down_after_defrag.insert(id);
    }

    /// Membership changes applied so far
    pub async fn changes(&self) -> Vec<MembershipChange> {
        self.inner.lock().await.changes.clone()
    }

    /// Defragmentations completed so far
    pub async fn defrags(&self) -> Vec<DefragRecord> {
        self.inner.lock().await.defrags.clone()
    }

    /// Most defragmentations ever observed running at once
    pub fn max_concurrent_defrags(&self) -> usize {
        self.max_defrags_in_flight.load(Ordering::SeqCst)
    }

    /// Number of probes answered or attempted
    pub fn probe_count(&self) -> usize {
        self.probe_count.load(Ordering::SeqCst)
    }
}

impl FakeInner {
    fn find_mut(&mut self, id: MemberId) -> Result<&mut FakeMember> {
        self.members
            .iter_mut()
            .find(|m| m.member.id == id)
            .ok_or_else(|| Error::MemberNotFound(format!("{:x}", id)))
    }

    fn peer_url_taken(&self, urls: &[String], except: Option<MemberId>) -> bool {
        self.members
            .iter()
            .filter(|m| Some(m.member.id) != except)
            .any(|m| urls.iter().any(|u| m.member.has_peer_url(u)))
    }

    fn apply(&mut self, change: &MembershipChange) -> Result<Member> {
        match change {
            MembershipChange::Add { peer_urls } | MembershipChange::AddLearner { peer_urls } => {
                if self.peer_url_taken(peer_urls, None) {
                    return Err(Error::Conflict(format!("peer URL {:?} already exists", peer_urls)));
                }
                let is_learner = matches!(change, MembershipChange::AddLearner { .. });
                let member = Member::unstarted(self.next_id, peer_urls.clone(), is_learner);
                self.next_id += 1;
                self.members.push(FakeMember {
                    probe: default_probe(&member),
                    member: member.clone(),
                    db_size: 0,
                    db_size_in_use: 0,
                });
                Ok(member)
            }
            MembershipChange::Promote { id } => {
                let entry = self.find_mut(*id)?;
                if !entry.member.is_learner {
                    return Err(Error::Transport(format!("member {:x} is not a learner", id)));
                }
                entry.member.is_learner = false;
                Ok(entry.member.clone())
            }
            MembershipChange::Remove { id } => {
                let index = self
                    .members
                    .iter()
                    .position(|m| m.member.id == *id)
                    .ok_or_else(|| Error::MemberNotFound(format!("{:x}", id)))?;
                if self.leader == Some(*id) {
                    self.leader = None;
                }
                Ok(self.members.remove(index).member)
            }
            MembershipChange::UpdatePeerUrls { id, peer_urls } => {
                if self.peer_url_taken(peer_urls, Some(*id)) {
                    return Err(Error::Conflict(format!("peer URL {:?} already exists", peer_urls)));
                }
                let entry = self.find_mut(*id)?;
                entry.member.peer_urls = peer_urls.clone();
                Ok(entry.member.clone())
            }
        }
    }
}

/// Counts a running defragmentation until dropped, even when the caller
/// abandons the future part way through
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    running: usize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let running = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, running }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl StoreTransport for FakeStore {
    async fn probe_status(&self, member: &Member, _deadline: Instant) -> Result<StatusProbe> {
        self.probe_count.fetch_add(1, Ordering::SeqCst);

        let (canned, probe) = {
            let inner = self.inner.lock().await;
            let entry = inner
                .members
                .iter()
                .find(|m| m.member.id == member.id)
                .ok_or_else(|| Error::Transport(format!("no route to member {}", member)))?;

            let mut probe = StatusProbe::reported(member.id)
                .with_db_size(entry.db_size, entry.db_size_in_use)
                .with_raft(2, 100, 90);
            probe.is_learner = entry.member.is_learner;
            if let Some(leader) = inner.leader {
                probe = probe.with_leader(leader);
            }
            (entry.probe.clone(), probe)
        };

        match canned {
            CannedProbe::Healthy => Ok(probe),
            CannedProbe::Alarmed(errors) => Ok(probe.with_errors(errors)),
            CannedProbe::Unreachable(reason) => Err(Error::Transport(reason)),
            CannedProbe::Hang => {
                futures::future::pending::<()>().await;
                Ok(StatusProbe::unreachable(member.id, ProbeFailure::Timeout))
            }
        }
    }

    async fn submit_membership_change(
        &self,
        change: &MembershipChange,
        _deadline: Instant,
    ) -> Result<MembershipAck> {
        let mut inner = self.inner.lock().await;
        if let Some(reason) = inner.fail_next_change.take() {
            return Err(Error::Transport(reason));
        }

        let member = inner.apply(change)?;
        tracing::debug!("fake store: applied {} for {}", change.kind(), member);
        inner.changes.push(change.clone());
        Ok(MembershipAck { member })
    }

    async fn submit_defragment(&self, member: &Member, _deadline: Instant) -> Result<()> {
        let in_flight = InFlight::enter(&self.defrags_in_flight);
        self.max_defrags_in_flight.fetch_max(in_flight.running, Ordering::SeqCst);
        let started = Instant::now();

        if !self.defrag_delay.is_zero() {
            tokio::time::sleep(self.defrag_delay).await;
        }

        let result = {
            let mut inner = self.inner.lock().await;
            let failing = inner.failing_defrags.contains(&member.id);
            let goes_down = inner.down_after_defrag.contains(&member.id);
            match inner.find_mut(member.id) {
                Ok(_) if failing => Err(Error::Transport(format!("defragment of {} failed", member))),
                Ok(entry) => {
                    entry.db_size = entry.db_size_in_use;
                    if goes_down {
                        entry.probe = CannedProbe::Unreachable("restarting after defragment".into());
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        drop(in_flight);
        let mut inner = self.inner.lock().await;
        inner.defrags.push(DefragRecord {
            member_id: member.id,
            started,
            finished: Instant::now(),
        });
        result
    }
}
