//! ctlgroup - Redundant Controller Group Coordinator
//!
//! Keeps a small group of redundant SDN controller processes in agreement
//! about who is in the group and which one drives the external control
//! plane (POX by default). Only the elected master runs the control process.
//!
//! # Architecture
//!
//! Membership comes from a group-communication transport: view changes,
//! suspicion notices and best-effort datagrams. Every node derives the same
//! master from the same view (lowest live node id), so mastership needs no
//! extra messages. Membership and mastership are eventually consistent;
//! there is no consensus log.
//!
//! # Features
//!
//! - Versioned, atomically replaced membership views
//! - Deterministic master election with suspicion-driven failover
//! - Broadcast/collect node-info refresh with per-call sessions
//! - Administrative detach of a node
//! - In-memory and UDP multicast transports
//! - HTTP admin API and control CLI

pub mod config;
pub mod error;
pub mod state;
pub mod protocol;
pub mod transport;
pub mod exchange;
pub mod supervisor;
pub mod coordinator;
pub mod api;

pub use config::CtlGroupConfig;
pub use coordinator::{ClusterEvent, Coordinator, LifecycleState, NodeStatus};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::CtlGroupConfig;
    pub use crate::coordinator::{ClusterEvent, Coordinator, LifecycleState, NodeStatus};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::protocol::{Message, NodeInfoResponse};
    pub use crate::state::{Member, Node, NodeId, View};
    pub use crate::supervisor::{ControlProcessSupervisor, ProcessSupervisor};
    pub use crate::transport::{MemoryNetwork, Transport, UdpTransport};
}
