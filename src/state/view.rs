//! Cluster Views
//!
//! Immutable, versioned snapshots of group membership.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric node identifier; also the election priority (lowest wins)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId(id)
    }
}

/// Member descriptor as reported by the transport in a view change
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub name: String,
    /// Transport address of the member
    pub address: String,
}

impl Member {
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
        }
    }
}

/// A node as seen in a particular view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier
    pub id: NodeId,
    /// Node name
    pub name: String,
    /// Transport address
    pub address: String,
    /// Whether this node is the elected master of the view
    pub is_master: bool,
    /// When the node was last observed joining the group
    pub last_seen_at: DateTime<Utc>,
    /// Reported unreachable and not heard from since
    pub suspected: bool,
}

impl Node {
    /// Wrap a freshly observed member
    pub fn observed(member: Member, at: DateTime<Utc>) -> Self {
        Self {
            id: member.id,
            name: member.name,
            address: member.address,
            is_master: false,
            last_seen_at: at,
            suspected: false,
        }
    }
}

/// Versioned snapshot of the group membership
///
/// Members are unique by id and kept in ascending id order, so any two
/// nodes holding views with the same member set hold identical member lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct View {
    generation: u64,
    members: Vec<Node>,
    observed_at: DateTime<Utc>,
}

impl View {
    /// Build a view, normalising member order and uniqueness
    pub fn new(generation: u64, mut members: Vec<Node>, observed_at: DateTime<Utc>) -> Self {
        members.sort_by_key(|n| n.id);
        members.dedup_by_key(|n| n.id);
        Self {
            generation,
            members,
            observed_at,
        }
    }

    /// The view before any transport view has been accepted
    pub fn empty() -> Self {
        Self::new(0, Vec::new(), Utc::now())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn members(&self) -> &[Node] {
        &self.members
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Look up a member by id
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.members
            .binary_search_by_key(&id, |n| n.id)
            .ok()
            .map(|idx| &self.members[idx])
    }

    /// Look up a member by transport address
    pub fn by_address(&self, address: &str) -> Option<&Node> {
        self.members.iter().find(|n| n.address == address)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// The member flagged as master, if any
    pub fn master(&self) -> Option<&Node> {
        self.members.iter().find(|n| n.is_master)
    }

    /// Copy of this view with each member passed through `f`; generation is kept
    pub(crate) fn with_members<F>(&self, f: F) -> Self
    where
        F: FnMut(&mut Node),
    {
        let mut members = self.members.clone();
        members.iter_mut().for_each(f);
        Self {
            generation: self.generation,
            members,
            observed_at: self.observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u64) -> Node {
        Node::observed(Member::new(id, format!("n{}", id), format!("10.0.0.{}:7800", id)), Utc::now())
    }

    #[test]
    fn test_view_orders_and_dedups() {
        let view = View::new(1, vec![node(3), node(1), node(2), node(1)], Utc::now());
        let ids: Vec<u64> = view.members().iter().map(|n| n.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn test_lookup() {
        let view = View::new(4, vec![node(5), node(9)], Utc::now());
        assert_eq!(view.get(NodeId(9)).map(|n| n.name.as_str()), Some("n9"));
        assert!(view.get(NodeId(7)).is_none());
        assert_eq!(view.by_address("10.0.0.5:7800").map(|n| n.id), Some(NodeId(5)));
        assert!(view.master().is_none());
    }

    #[test]
    fn test_with_members_keeps_generation() {
        let view = View::new(7, vec![node(1), node(2)], Utc::now());
        let flagged = view.with_members(|n| n.is_master = n.id == NodeId(2));
        assert_eq!(flagged.generation(), 7);
        assert_eq!(flagged.master().map(|n| n.id), Some(NodeId(2)));
        assert!(view.master().is_none());
    }
}
