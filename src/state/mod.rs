//! State Management Module
//!
//! Derived cluster state rebuilt from transport events: the current view
//! of the group, suspicion of unreachable members, and the elected master.

mod view;
mod membership;
mod failure;
pub mod election;

pub use view::{Member, Node, NodeId, View};
pub use membership::MembershipTracker;
pub use failure::{FailureDetector, Suspicion};
pub use election::{ElectionState, MasterChange, MasterElector};
