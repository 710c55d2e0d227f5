//! Cluster Member
//!
//! Identity and endpoints of a single consensus store member.

use serde::{Deserialize, Serialize};

/// Unique numeric member identifier assigned by the store
pub type MemberId = u64;

/// A member of the consensus cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Unique member identifier
    pub id: MemberId,
    /// Human-readable name (empty until the member process has started)
    pub name: String,
    /// URLs used for peer (replication) traffic
    pub peer_urls: Vec<String>,
    /// URLs used for client traffic (empty until the member process has started)
    pub client_urls: Vec<String>,
    /// Non-voting member
    pub is_learner: bool,
}

impl Member {
    /// Create a started voting member
    pub fn voter(
        id: MemberId,
        name: impl Into<String>,
        peer_url: impl Into<String>,
        client_url: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            peer_urls: vec![peer_url.into()],
            client_urls: vec![client_url.into()],
            is_learner: false,
        }
    }

    /// Create a member that was added to the consensus layer but never joined
    ///
    /// The store only learns a member's name and client URLs once its
    /// process starts, so a fresh entry carries nothing but peer URLs.
    pub fn unstarted(id: MemberId, peer_urls: Vec<String>, is_learner: bool) -> Self {
        Self {
            id,
            name: String::new(),
            peer_urls,
            client_urls: Vec::new(),
            is_learner,
        }
    }

    /// Mark this member as a learner
    pub fn as_learner(mut self) -> Self {
        self.is_learner = true;
        self
    }

    /// Whether the member process has published its name and client URLs
    pub fn is_started(&self) -> bool {
        !self.name.is_empty() && !self.client_urls.is_empty()
    }

    /// Whether the member counts toward quorum
    pub fn is_voter(&self) -> bool {
        !self.is_learner
    }

    /// Whether this member advertises the given peer URL
    pub fn has_peer_url(&self, url: &str) -> bool {
        self.peer_urls.iter().any(|u| u == url)
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "<unstarted>[{:x}]", self.id)
        } else {
            write!(f, "{}[{:x}]", self.name, self.id)
        }
    }
}

/// Quorum size (majority) for a number of voting members
pub fn quorum_size(voters: usize) -> usize {
    (voters / 2) + 1
}
