//! Node Info Exchange
//!
//! Broadcast-request / timed-collect diagnostics. Each `refresh` call owns
//! a session keyed by a fresh request id; responses are routed to the
//! session carrying their id and dropped otherwise.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::{Message, NodeInfoResponse};
use crate::state::{NodeId, View};
use crate::transport::{Channel, Destination};

/// Stand-in deadline for timeouts too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Routes node-info responses to in-flight refresh sessions
#[derive(Default)]
pub struct NodeInfoExchange {
    sessions: Mutex<HashMap<Uuid, mpsc::UnboundedSender<NodeInfoResponse>>>,
}

impl NodeInfoExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, mpsc::UnboundedSender<NodeInfoResponse>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of refresh calls currently collecting
    pub fn in_flight(&self) -> usize {
        self.sessions().len()
    }

    /// Hand a response to the session waiting for its request id
    ///
    /// Returns false when no session is waiting (late or foreign response).
    pub fn deliver(&self, response: NodeInfoResponse) -> bool {
        let sessions = self.sessions();
        match sessions.get(&response.request_id) {
            Some(session) => session.send(response).is_ok(),
            None => {
                tracing::trace!(
                    "Dropping node-info from {} for unknown request {}",
                    response.node_id,
                    response.request_id
                );
                false
            }
        }
    }

    /// Ask every member of `view` for its node info and collect answers
    ///
    /// Collection ends when every member of `view` has answered or `timeout`
    /// elapses. A timeout is not an error: whatever arrived is returned,
    /// possibly nothing. Only a request that cannot be sent fails.
    pub async fn refresh(
        self: &Arc<Self>,
        channel: &dyn Channel,
        view: &View,
        timeout: Duration,
    ) -> Result<Vec<NodeInfoResponse>> {
        let mut session = self.open(view, timeout);

        let payload = Message::RefreshRequest { request_id: session.request_id }
            .encode()
            .map_err(|e| Error::Refresh(format!("Failed to encode request: {}", e)))?;

        if view.is_empty() {
            channel.send(Destination::Broadcast, payload)
        } else {
            view.members()
                .iter()
                .try_for_each(|node| channel.send(Destination::Node(node.address.clone()), payload.clone()))
        }
        .map_err(|e| Error::Refresh(format!("Failed to send request: {}", e)))?;

        tracing::debug!(
            "Refresh {} sent to {} member(s), collecting for {:?}",
            session.request_id,
            view.len(),
            timeout
        );

        Ok(session.collect().await)
    }

    fn open(self: &Arc<Self>, view: &View, timeout: Duration) -> RefreshSession {
        let request_id = Uuid::new_v4();
        let (tx, responses) = mpsc::unbounded_channel();
        self.sessions().insert(request_id, tx);

        let expected = if view.is_empty() {
            None
        } else {
            Some(view.members().iter().map(|n| n.id).collect())
        };

        RefreshSession {
            request_id,
            expected,
            collected: BTreeMap::new(),
            deadline: deadline_after(timeout),
            responses,
            exchange: Arc::clone(self),
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// One refresh call's collection state; deregisters itself when dropped
struct RefreshSession {
    request_id: Uuid,
    /// Members believed present at request time; None when unknown
    expected: Option<BTreeSet<NodeId>>,
    collected: BTreeMap<NodeId, NodeInfoResponse>,
    deadline: Instant,
    responses: mpsc::UnboundedReceiver<NodeInfoResponse>,
    exchange: Arc<NodeInfoExchange>,
}

impl RefreshSession {
    fn complete(&self) -> bool {
        match &self.expected {
            Some(expected) => expected.iter().all(|id| self.collected.contains_key(id)),
            None => false,
        }
    }

    async fn collect(&mut self) -> Vec<NodeInfoResponse> {
        while !self.complete() {
            match tokio::time::timeout_at(self.deadline, self.responses.recv()).await {
                Ok(Some(response)) => {
                    // Latest answer per node wins
                    self.collected.insert(response.node_id, response);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(
                        "Refresh {} timed out with {} response(s)",
                        self.request_id,
                        self.collected.len()
                    );
                    break;
                }
            }
        }

        std::mem::take(&mut self.collected).into_values().collect()
    }
}

impl Drop for RefreshSession {
    fn drop(&mut self) {
        self.exchange.sessions().remove(&self.request_id);
    }
}
