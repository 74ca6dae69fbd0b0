//! Group Protocol
//!
//! Application messages exchanged between group members. Payloads are JSON
//! objects tagged by `kind` with stable camelCase field names.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::NodeId;

/// Snapshot a node publishes about itself in answer to a refresh request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoResponse {
    pub request_id: Uuid,
    pub node_id: NodeId,
    pub name: String,
    pub address: String,
    pub cluster_name: String,
    pub is_master: bool,
}

/// Protocol messages for group members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Message {
    /// Ask every member to report its node info
    RefreshRequest { request_id: Uuid },

    /// A member's answer to a refresh request
    NodeInfo(NodeInfoResponse),

    /// Order the addressed node to leave the group; never acknowledged
    Terminate { target_node_id: NodeId },
}

impl Message {
    /// Serialize message to bytes
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::RefreshRequest { .. } => "refresh-request",
            Message::NodeInfo(_) => "node-info",
            Message::Terminate { .. } => "terminate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_refresh_request_wire_format() {
        let request_id = Uuid::new_v4();
        let bytes = Message::RefreshRequest { request_id }.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value, json!({ "kind": "refresh-request", "requestId": request_id.to_string() }));
    }

    #[test]
    fn test_node_info_wire_format() {
        let request_id = Uuid::new_v4();
        let msg = Message::NodeInfo(NodeInfoResponse {
            request_id,
            node_id: NodeId(2),
            name: "ctl-b".to_string(),
            address: "10.0.0.2:7800".to_string(),
            cluster_name: "sdn".to_string(),
            is_master: true,
        });
        let value: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "kind": "node-info",
                "requestId": request_id.to_string(),
                "nodeId": 2,
                "name": "ctl-b",
                "address": "10.0.0.2:7800",
                "clusterName": "sdn",
                "isMaster": true,
            })
        );
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_terminate_from_foreign_json() {
        let msg = Message::decode(br#"{"kind":"terminate","targetNodeId":7}"#).unwrap();
        assert_eq!(msg, Message::Terminate { target_node_id: NodeId(7) });
        assert_eq!(msg.type_name(), "terminate");
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Message::decode(br#"{"kind":"vote","term":3}"#).is_err());
    }
}
