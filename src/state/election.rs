//! Master Election
//!
//! The master is a pure function of the view: the member with the lowest
//! node id that is not currently suspected. Ids are unique within a view,
//! so two nodes holding the same view always agree without exchanging
//! messages.

use super::view::{Node, NodeId, View};

/// Result of the most recent election
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectionState {
    /// Elected master, if the view had an eligible member
    pub current_master: Option<Node>,
    /// Generation of the view the result was computed from
    pub generation: u64,
}

/// A change of elected master between two evaluations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterChange {
    pub previous: Option<Node>,
    pub current: Option<Node>,
}

/// Derives the master from each installed view
#[derive(Debug, Default)]
pub struct MasterElector {
    state: ElectionState,
}

impl MasterElector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elect the master of `view`
    pub fn elect_from(view: &View) -> Option<&Node> {
        view.members()
            .iter()
            .filter(|n| !n.suspected)
            .min_by_key(|n| n.id)
    }

    /// Recompute the election for `view`
    ///
    /// Returns the change when the elected master id differs from the
    /// previous evaluation.
    pub fn reevaluate(&mut self, view: &View) -> Option<MasterChange> {
        let elected = Self::elect_from(view).cloned();
        let changed = self.master_id() != elected.as_ref().map(|n| n.id);

        let previous = std::mem::replace(
            &mut self.state,
            ElectionState {
                current_master: elected,
                generation: view.generation(),
            },
        );

        if !changed {
            return None;
        }

        match &self.state.current_master {
            Some(master) => tracing::info!(
                "Elected master {}#{} from view {}",
                master.name,
                master.id,
                view.generation()
            ),
            None => tracing::warn!("No eligible master in view {}", view.generation()),
        }

        Some(MasterChange {
            previous: previous.current_master,
            current: self.state.current_master.clone(),
        })
    }

    pub fn state(&self) -> &ElectionState {
        &self.state
    }

    pub fn master_id(&self) -> Option<NodeId> {
        self.state.current_master.as_ref().map(|n| n.id)
    }

    /// Check if `id` won the last election
    pub fn is_master(&self, id: NodeId) -> bool {
        self.master_id() == Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Member, MembershipTracker};
    use chrono::Utc;

    fn view(ids: &[u64]) -> View {
        let nodes = ids
            .iter()
            .map(|id| Node::observed(Member::new(*id, format!("n{}", id), format!("mem://n{}", id)), Utc::now()))
            .collect();
        View::new(1, nodes, Utc::now())
    }

    #[test]
    fn test_elect_lowest_id() {
        let v = view(&[3, 1, 2]);
        assert_eq!(MasterElector::elect_from(&v).map(|n| n.id), Some(NodeId(1)));
    }

    #[test]
    fn test_empty_view_has_no_master() {
        assert!(MasterElector::elect_from(&view(&[])).is_none());
    }

    #[test]
    fn test_independent_copies_agree() {
        let a = view(&[9, 4, 7]);
        let b = view(&[7, 9, 4]);
        let first = MasterElector::elect_from(&a).cloned();
        assert_eq!(first.as_ref().map(|n| n.id), MasterElector::elect_from(&b).map(|n| n.id));
        assert_eq!(first.as_ref().map(|n| n.id), MasterElector::elect_from(&a).map(|n| n.id));
    }

    #[test]
    fn test_master_removed() {
        let v1 = view(&[1, 2, 3]);
        let master = MasterElector::elect_from(&v1).unwrap().id;

        let v2 = view(&[2, 3]);
        let next = MasterElector::elect_from(&v2).unwrap().id;
        assert_ne!(master, next);
        assert_eq!(next, NodeId(2));

        // Removing the last member leaves no master
        let v3 = view(&[]);
        assert!(MasterElector::elect_from(&v3).is_none());
    }

    #[test]
    fn test_suspected_members_are_skipped() {
        let tracker = MembershipTracker::new();
        tracker.on_view_change(vec![Member::new(1, "a", "mem://a"), Member::new(2, "b", "mem://b")]);
        tracker.mark_suspected("mem://a");

        let current = tracker.current();
        assert_eq!(MasterElector::elect_from(&current).map(|n| n.id), Some(NodeId(2)));
    }

    #[test]
    fn test_reevaluate_reports_changes_only() {
        let mut elector = MasterElector::new();

        let change = elector.reevaluate(&view(&[2, 5])).unwrap();
        assert!(change.previous.is_none());
        assert_eq!(change.current.map(|n| n.id), Some(NodeId(2)));

        assert!(elector.reevaluate(&view(&[2, 5, 8])).is_none());
        assert!(elector.is_master(NodeId(2)));

        let change = elector.reevaluate(&view(&[1, 2, 5, 8])).unwrap();
        assert_eq!(change.previous.map(|n| n.id), Some(NodeId(2)));
        assert_eq!(elector.master_id(), Some(NodeId(1)));

        let change = elector.reevaluate(&view(&[])).unwrap();
        assert!(change.current.is_none());
        assert_eq!(elector.state().current_master, None);
    }
}
