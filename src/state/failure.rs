//! Failure Detection
//!
//! Reacts to transport suspicion and recovery notifications. Suspicion never
//! removes a member: only a later transport view does that.

use std::sync::Arc;

use super::membership::MembershipTracker;
use super::view::Node;

/// Outcome of a suspicion notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suspicion {
    /// The address is not a member of the current view
    Unknown,
    /// The member is still suspected from an earlier notification
    Repeated,
    /// The member is now suspected
    New {
        node: Node,
        /// The member was the master of the current view
        was_master: bool,
    },
}

/// Marks unreachable members of the current view
pub struct FailureDetector {
    tracker: Arc<MembershipTracker>,
}

impl FailureDetector {
    pub fn new(tracker: Arc<MembershipTracker>) -> Self {
        Self { tracker }
    }

    /// Handle a transport suspicion for `address`
    pub fn on_suspect(&self, address: &str) -> Suspicion {
        let view = self.tracker.current();
        let Some(node) = view.by_address(address) else {
            tracing::debug!("Ignoring suspicion of {} (not in view {})", address, view.generation());
            return Suspicion::Unknown;
        };

        if node.suspected {
            return Suspicion::Repeated;
        }

        let was_master = node.is_master;
        match self.tracker.mark_suspected(address) {
            Some(node) => {
                tracing::warn!(
                    "Member {}#{} at {} may have crashed{}",
                    node.name,
                    node.id,
                    node.address,
                    if was_master { " (current master)" } else { "" }
                );
                Suspicion::New { node, was_master }
            }
            None => Suspicion::Repeated,
        }
    }

    /// Handle a transport recovery for `address`
    ///
    /// Returns the member when it was suspected until now.
    pub fn on_recover(&self, address: &str) -> Option<Node> {
        let node = self.tracker.mark_recovered(address)?;
        tracing::info!("Member {}#{} at {} is reachable again", node.name, node.id, node.address);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Member, NodeId};

    fn setup() -> (Arc<MembershipTracker>, FailureDetector) {
        let tracker = Arc::new(MembershipTracker::new());
        tracker.on_view_change(vec![
            Member::new(1, "a", "mem://a"),
            Member::new(2, "b", "mem://b"),
        ]);
        tracker.mark_master(Some(NodeId(1)));
        let detector = FailureDetector::new(Arc::clone(&tracker));
        (tracker, detector)
    }

    #[test]
    fn test_suspect_master() {
        let (tracker, detector) = setup();

        match detector.on_suspect("mem://a") {
            Suspicion::New { node, was_master } => {
                assert_eq!(node.id, NodeId(1));
                assert!(was_master);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(tracker.current().get(NodeId(1)).unwrap().suspected);
    }

    #[test]
    fn test_repeated_and_unknown() {
        let (tracker, detector) = setup();

        assert!(matches!(detector.on_suspect("mem://b"), Suspicion::New { was_master: false, .. }));
        let after_first = tracker.current();
        assert_eq!(detector.on_suspect("mem://b"), Suspicion::Repeated);
        assert_eq!(*tracker.current(), *after_first);
        assert_eq!(detector.on_suspect("mem://zzz"), Suspicion::Unknown);
    }

    #[test]
    fn test_recover() {
        let (tracker, detector) = setup();

        assert!(detector.on_recover("mem://b").is_none());
        detector.on_suspect("mem://b");
        assert_eq!(detector.on_recover("mem://b").map(|n| n.id), Some(NodeId(2)));
        assert!(!tracker.current().get(NodeId(2)).unwrap().suspected);

        // Suspectable again after recovering
        assert!(matches!(detector.on_suspect("mem://b"), Suspicion::New { .. }));
    }
}
