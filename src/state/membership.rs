//! Cluster Membership Management
//!
//! Turns transport view changes into versioned `View`s and publishes them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use super::view::{Member, Node, NodeId, View};

/// Holds the locally installed view
///
/// Views are never mutated in place: every change builds a new `View` and
/// swaps it in through a watch channel, so readers always see a complete one.
pub struct MembershipTracker {
    current: watch::Sender<Arc<View>>,
}

impl MembershipTracker {
    /// Create a tracker holding the empty generation-0 view
    pub fn new() -> Self {
        let (current, _) = watch::channel(Arc::new(View::empty()));
        Self { current }
    }

    /// The most recently installed view
    pub fn current(&self) -> Arc<View> {
        self.current.borrow().clone()
    }

    /// Subscribe to view replacements
    pub fn subscribe(&self) -> watch::Receiver<Arc<View>> {
        self.current.subscribe()
    }

    /// Install the view reported by the transport
    pub fn on_view_change(&self, raw_members: Vec<Member>) -> Arc<View> {
        let previous = self.current();
        let now = Utc::now();

        let mut members: BTreeMap<NodeId, Member> = BTreeMap::new();
        for member in raw_members {
            match members.get(&member.id) {
                // Two addresses claiming one id: keep the lowest address so
                // every node resolves the conflict the same way.
                Some(existing) if existing.address <= member.address => {
                    tracing::warn!(
                        "Duplicate node id {} at {} (keeping {})",
                        member.id,
                        member.address,
                        existing.address
                    );
                }
                _ => {
                    members.insert(member.id, member);
                }
            }
        }

        let nodes: Vec<Node> = members
            .into_values()
            .map(|member| match previous.get(member.id) {
                Some(prior) => Node {
                    is_master: prior.is_master,
                    last_seen_at: prior.last_seen_at,
                    // A rejoin under a new address starts unsuspected
                    suspected: prior.suspected && prior.address == member.address,
                    ..Node::observed(member, now)
                },
                None => Node::observed(member, now),
            })
            .collect();

        let view = Arc::new(View::new(previous.generation() + 1, nodes, now));

        tracing::info!(
            "Installed view {} with {} member(s): [{}]",
            view.generation(),
            view.len(),
            view.members()
                .iter()
                .map(|n| format!("{}#{}", n.name, n.id))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.install(Arc::clone(&view));
        view
    }

    /// Flag the member at `address` as suspected
    ///
    /// Returns the updated node only when the flag actually changed.
    pub fn mark_suspected(&self, address: &str) -> Option<Node> {
        let current = self.current();
        let target = current.by_address(address)?;
        if target.suspected {
            return None;
        }

        let target_id = target.id;
        let view = Arc::new(current.with_members(|n| {
            if n.id == target_id {
                n.suspected = true;
            }
        }));
        let node = view.get(target_id).cloned();
        self.install(view);
        node
    }

    /// Clear the suspicion of the member at `address`
    ///
    /// Returns the updated node only when it was suspected.
    pub fn mark_recovered(&self, address: &str) -> Option<Node> {
        let current = self.current();
        let target = current.by_address(address)?;
        if !target.suspected {
            return None;
        }

        let target_id = target.id;
        let view = Arc::new(current.with_members(|n| {
            if n.id == target_id {
                n.suspected = false;
            }
        }));
        let node = view.get(target_id).cloned();
        self.install(view);
        node
    }

    /// Flag `master` as the only master of the current view
    pub fn mark_master(&self, master: Option<NodeId>) -> Arc<View> {
        let current = self.current();
        if current.master().map(|n| n.id) == master
            && current.members().iter().filter(|n| n.is_master).count() <= 1
        {
            return current;
        }

        let view = Arc::new(current.with_members(|n| n.is_master = Some(n.id) == master));
        self.install(Arc::clone(&view));
        view
    }

    fn install(&self, view: Arc<View>) {
        self.current.send_replace(view);
    }
}

impl Default for MembershipTracker {
    fn default() -> Self {
        Self::new()
    }
}
