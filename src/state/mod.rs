//! State Management Module
//!
//! Holds the cluster roster: who is a member and how to reach them.

mod member;
mod registry;

pub use member::{quorum_size, Member, MemberId};
pub use registry::MemberRegistry;
