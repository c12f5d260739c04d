//! Cluster membership and feature version gates.
//!
//! - [`version`] - Version parsing and feature minimums

pub mod version;

pub use version::{Version, MIN_VERSION_KEYRING, MIN_VERSION_VARIABLE_LOCKS};

use parking_lot::RwLock;

/// Liveness of a server as seen by the membership layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberStatus {
    /// Reachable.
    Alive,
    /// Unreachable but still a member.
    Failed,
    /// Gracefully left.
    Left,
}

/// A server in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMember {
    /// Node name.
    pub name: String,
    /// Region.
    pub region: String,
    /// Advertised version.
    pub version: Version,
    /// Liveness.
    pub status: MemberStatus,
}

impl ServerMember {
    /// Alive member.
    pub fn new(name: impl Into<String>, region: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            version,
            status: MemberStatus::Alive,
        }
    }
}

/// Source of the current server list.
pub trait Membership: Send + Sync {
    /// Every known server.
    fn members(&self) -> Vec<ServerMember>;
}

/// Fixed member list, updated by hand.
#[derive(Default)]
pub struct StaticMembership {
    members: RwLock<Vec<ServerMember>>,
}

impl StaticMembership {
    /// Create from a list of members.
    pub fn new(members: Vec<ServerMember>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    /// Add or replace a member by name.
    pub fn upsert(&self, member: ServerMember) {
        let mut members = self.members.write();
        match members.iter_mut().find(|m| m.name == member.name) {
            Some(existing) => *existing = member,
            None => members.push(member),
        }
    }

    /// Change a member's status. Returns false when the member is unknown.
    pub fn set_status(&self, name: &str, status: MemberStatus) -> bool {
        let mut members = self.members.write();
        match members.iter_mut().find(|m| m.name == name) {
            Some(member) => {
                member.status = status;
                true
            }
            None => false,
        }
    }
}

impl Membership for StaticMembership {
    fn members(&self) -> Vec<ServerMember> {
        self.members.read().clone()
    }
}

/// Check that every server in `region` runs at least `min`.
///
/// Servers that left are ignored. Failed servers count only when
/// `check_failed` is set, since they may come back on the old version.
pub fn servers_meet_minimum_version(
    members: &[ServerMember],
    region: &str,
    min: &Version,
    check_failed: bool,
) -> bool {
    members
        .iter()
        .filter(|m| m.region == region)
        .filter(|m| match m.status {
            MemberStatus::Alive => true,
            MemberStatus::Failed => check_failed,
            MemberStatus::Left => false,
        })
        .all(|m| m.version.meets(min))
}
