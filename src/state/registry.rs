//! Member Registry
//!
//! The roster of cluster members. All other components read clones of the
//! roster; only the registry mutates it.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::member::{Member, MemberId};
use crate::error::{Error, Result};

/// Ordered roster of cluster members
pub struct MemberRegistry {
    /// Members in roster order
    members: RwLock<Vec<Member>>,
    /// Bumped on every mutation; snapshots taken at an older generation are stale
    generation: AtomicU64,
}

impl MemberRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            members: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Create a registry seeded with an initial roster
    pub fn with_members(members: Vec<Member>) -> Result<Self> {
        let mut roster: Vec<Member> = Vec::with_capacity(members.len());
        for member in members {
            check_unique(&roster, &member)?;
            roster.push(member);
        }

        Ok(Self {
            members: RwLock::new(roster),
            generation: AtomicU64::new(0),
        })
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Get the current roster
    pub async fn list(&self) -> Vec<Member> {
        self.members.read().await.clone()
    }

    /// Get the roster together with the generation it belongs to
    pub async fn versioned_list(&self) -> (u64, Vec<Member>) {
        let members = self.members.read().await;
        (self.generation(), members.clone())
    }

    /// Number of members
    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    /// Whether the roster is empty
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Get a member by exact (case-sensitive) name
    pub async fn get(&self, name: &str) -> Result<Member> {
        let members = self.members.read().await;
        members
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| Error::MemberNotFound(name.to_string()))
    }

    /// Get a member by id
    pub async fn get_by_id(&self, id: MemberId) -> Result<Member> {
        let members = self.members.read().await;
        members
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| Error::MemberNotFound(format!("{:x}", id)))
    }

    /// Find the member advertising a peer URL
    pub async fn find_by_peer_url(&self, url: &str) -> Option<Member> {
        let members = self.members.read().await;
        members.iter().find(|m| m.has_peer_url(url)).cloned()
    }

    /// Add a member to the end of the roster
    pub async fn add(&self, member: Member) -> Result<()> {
        let mut members = self.members.write().await;
        check_unique(&members, &member)?;

        tracing::debug!("registry: added member {}", member);
        members.push(member);
        self.bump();
        Ok(())
    }

    /// Remove a member by id
    pub async fn remove(&self, id: MemberId) -> Result<Member> {
        let mut members = self.members.write().await;
        let index = members
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| Error::MemberNotFound(format!("{:x}", id)))?;

        let removed = members.remove(index);
        tracing::debug!("registry: removed member {}", removed);
        self.bump();
        Ok(removed)
    }

    /// Replace a member's peer URLs, keeping its identity and roster position
    pub async fn update_peer_urls(&self, id: MemberId, peer_urls: Vec<String>) -> Result<Member> {
        self.update(id, |member| member.peer_urls = peer_urls).await
    }

    /// Refresh a member's record with what the store reports, keeping its id
    pub async fn refresh(&self, record: Member) -> Result<Member> {
        self.update(record.id, |member| *member = record).await
    }

    async fn update<F>(&self, id: MemberId, f: F) -> Result<Member>
    where
        F: FnOnce(&mut Member),
    {
        let mut members = self.members.write().await;
        let member = members
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::MemberNotFound(format!("{:x}", id)))?;

        f(member);
        let updated = member.clone();
        self.bump();
        Ok(updated)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for MemberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_unique(roster: &[Member], member: &Member) -> Result<()> {
    if roster.iter().any(|m| m.id == member.id) {
        return Err(Error::Conflict(format!("member id {:x} already registered", member.id)));
    }
    if !member.name.is_empty() && roster.iter().any(|m| m.name == member.name) {
        return Err(Error::Conflict(format!("member name '{}' already registered", member.name)));
    }
    Ok(())
}
