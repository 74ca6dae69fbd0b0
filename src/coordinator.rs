//! Cluster Coordinator
//!
//! Owns one node's membership in the controller group. Transport callbacks
//! feed the membership tracker, failure detector and elector; election
//! results drive the control process through a dedicated supervisor task so
//! callbacks never wait on process management.
//!
//! # Lifecycle
//!
//! `Uninitialized → Joining → Active → Leaving → Detached`. A failed `start`
//! returns to `Uninitialized`; `stop` and a remote terminate both end in
//! `Detached`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::config::CtlGroupConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::exchange::NodeInfoExchange;
use crate::protocol::{Message, NodeInfoResponse};
use crate::state::{FailureDetector, Member, MasterElector, MembershipTracker, Node, NodeId, Suspicion, View};
use crate::supervisor::ControlProcessSupervisor;
use crate::transport::{Channel, Destination, GroupSpec, Identity, Receiver, Transport};

/// Buffered cluster events per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

/// Node lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Joining,
    Active,
    Leaving,
    Detached,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Uninitialized => write!(f, "UNINITIALIZED"),
            LifecycleState::Joining => write!(f, "JOINING"),
            LifecycleState::Active => write!(f, "ACTIVE"),
            LifecycleState::Leaving => write!(f, "LEAVING"),
            LifecycleState::Detached => write!(f, "DETACHED"),
        }
    }
}

/// Push notifications for observers
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A transport view was installed
    ViewUpdated(Arc<View>),
    /// The elected master changed (None: no eligible member)
    MasterChanged(Option<Node>),
    /// A member was reported unreachable
    NodeSuspected(Node),
    /// A failure inside a callback or the supervisor task
    Error { kind: ErrorKind, message: String },
}

/// Local snapshot served by the admin API
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub lifecycle: LifecycleState,
    pub node_id: Option<NodeId>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub group: Option<String>,
    pub master: Option<Node>,
    pub is_master: bool,
    pub control_running: bool,
    /// Elected master whose control process failed to start
    pub degraded: bool,
    /// View generation the current election result was computed from
    pub election_generation: u64,
    /// Refresh calls still collecting answers
    pub refreshes_in_flight: usize,
    pub view: View,
}

/// Work for the supervisor task
enum SupervisorCommand {
    Start,
    Stop,
    Shutdown {
        reason: &'static str,
        done: Option<oneshot::Sender<()>>,
    },
}

/// Settings fixed by a `start` call
struct Session {
    identity: Identity,
    group: String,
    control_path: PathBuf,
    control_options: Vec<String>,
    /// Wait for peers before electing from a view holding only this node
    settle: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared by the coordinator, the transport callbacks and the
/// supervisor task
struct Shared {
    tracker: Arc<MembershipTracker>,
    detector: FailureDetector,
    elector: Mutex<MasterElector>,
    exchange: Arc<NodeInfoExchange>,
    lifecycle: watch::Sender<LifecycleState>,
    events: broadcast::Sender<ClusterEvent>,
    session: Mutex<Option<Arc<Session>>>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    control_running: AtomicBool,
    degraded: AtomicBool,
    /// Election deferred while alone in the first view
    settling: AtomicBool,
}

impl Shared {
    fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.borrow()
    }

    fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    fn channel(&self) -> Option<Arc<dyn Channel>> {
        lock(&self.channel).clone()
    }

    fn take_channel(&self) -> Option<Arc<dyn Channel>> {
        lock(&self.channel).take()
    }

    fn local_id(&self) -> Option<NodeId> {
        self.session().map(|s| s.identity.id)
    }

    fn is_master(&self) -> bool {
        self.local_id()
            .map(|id| lock(&self.elector).is_master(id))
            .unwrap_or(false)
    }

    fn publish(&self, event: ClusterEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn report(&self, context: &str, err: &Error) {
        tracing::warn!("{}: {}", context, err);
        self.publish(ClusterEvent::Error {
            kind: err.kind(),
            message: format!("{}: {}", context, err),
        });
    }

    fn command(&self, command: SupervisorCommand) {
        if self.commands.send(command).is_err() {
            tracing::error!("Supervisor task is gone");
        }
    }

    /// Re-run the election on the current view and act on the result
    fn reconcile(&self) {
        // Held throughout so master flags and supervisor commands follow
        // election order
        let mut elector = lock(&self.elector);
        let view = self.tracker.current();
        let change = elector.reevaluate(&view);
        let flagged = self.tracker.mark_master(elector.master_id());

        let Some(change) = change else {
            return;
        };

        let master = change.current.as_ref().and_then(|n| flagged.get(n.id).cloned());
        self.publish(ClusterEvent::MasterChanged(master));

        let Some(local) = self.local_id() else {
            return;
        };
        let was_master = change.previous.as_ref().map(|n| n.id) == Some(local);
        let now_master = change.current.as_ref().map(|n| n.id) == Some(local);

        if now_master && !was_master {
            tracing::info!("This node ({}) is now the master", local);
            self.command(SupervisorCommand::Start);
        } else if was_master && !now_master {
            tracing::info!("This node ({}) is no longer the master", local);
            self.command(SupervisorCommand::Stop);
        }
    }

    fn handle_view(self: &Arc<Self>, members: Vec<Member>) {
        if !matches!(self.lifecycle(), LifecycleState::Joining | LifecycleState::Active) {
            return;
        }

        let view = self.tracker.on_view_change(members);

        let activated = self.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::Joining {
                *state = LifecycleState::Active;
                true
            } else {
                false
            }
        });
        if activated {
            tracing::info!("Joined group with view {}, node is active", view.generation());
        }

        if !self.defer_election(&view, activated) {
            self.reconcile();
        }
        self.publish(ClusterEvent::ViewUpdated(self.tracker.current()));
    }

    /// Hold off electing while this node has seen no peer since joining
    ///
    /// A joining node's first view may hold only itself before it hears
    /// the existing members.
    fn defer_election(self: &Arc<Self>, view: &View, activated: bool) -> bool {
        let local = self.local_id();
        let alone = !view.is_empty() && view.members().iter().all(|n| Some(n.id) == local);
        if !alone {
            self.settling.store(false, Ordering::SeqCst);
            return false;
        }
        if !activated {
            return self.settling.load(Ordering::SeqCst);
        }

        let settle = self.session().map(|s| s.settle).unwrap_or_default();
        if settle.is_zero() {
            return false;
        }

        self.settling.store(true, Ordering::SeqCst);
        tracing::info!(
            "Alone in view {}, waiting {:?} for peers before electing",
            view.generation(),
            settle
        );
        let shared = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            if let Some(shared) = shared.upgrade() {
                shared.end_settle();
            }
        });
        true
    }

    fn end_settle(&self) {
        if self.settling.swap(false, Ordering::SeqCst) && self.lifecycle() == LifecycleState::Active {
            tracing::info!("No peers appeared, electing from view {}", self.tracker.current().generation());
            self.reconcile();
        }
    }

    fn handle_suspect(&self, address: &str) {
        if self.lifecycle() != LifecycleState::Active {
            return;
        }

        if let Suspicion::New { node, was_master } = self.detector.on_suspect(address) {
            self.publish(ClusterEvent::NodeSuspected(node));
            if was_master {
                self.reconcile();
            }
        }
    }

    fn handle_recover(&self, address: &str) {
        if self.lifecycle() != LifecycleState::Active {
            return;
        }

        // A recovered member may outrank the current master again
        if self.detector.on_recover(address).is_some() && !self.settling.load(Ordering::SeqCst) {
            self.reconcile();
        }
    }

    fn handle_message(&self, from: &str, payload: &[u8]) {
        if self.lifecycle() != LifecycleState::Active {
            return;
        }

        let message = match Message::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.report(&format!("Undecodable message from {}", from), &Error::Codec(e));
                return;
            }
        };
        tracing::trace!("Received {} from {}", message.type_name(), from);

        match message {
            Message::RefreshRequest { request_id } => self.answer_refresh(request_id, from),
            Message::NodeInfo(response) => {
                self.exchange.deliver(response);
            }
            Message::Terminate { target_node_id } => {
                if Some(target_node_id) == self.local_id() {
                    tracing::warn!("Terminate received from {}, leaving the group", from);
                    self.command(SupervisorCommand::Shutdown {
                        reason: "remote terminate",
                        done: None,
                    });
                } else {
                    tracing::debug!("Ignoring terminate for node {} from {}", target_node_id, from);
                }
            }
        }
    }

    fn answer_refresh(&self, request_id: Uuid, from: &str) {
        let (Some(session), Some(channel)) = (self.session(), self.channel()) else {
            tracing::debug!("Not answering refresh {} before the channel is open", request_id);
            return;
        };

        let response = NodeInfoResponse {
            request_id,
            node_id: session.identity.id,
            name: session.identity.name.clone(),
            address: channel.local_address().to_string(),
            cluster_name: session.group.clone(),
            is_master: self.is_master(),
        };

        let sent = Message::NodeInfo(response)
            .encode()
            .map_err(Error::from)
            .and_then(|payload| channel.send(Destination::Node(from.to_string()), payload));
        if let Err(e) = sent {
            self.report(&format!("Failed to answer refresh {}", request_id), &e);
        }
    }

    async fn start_control(&self, supervisor: &dyn ControlProcessSupervisor) {
        if self.lifecycle() != LifecycleState::Active || !self.is_master() {
            tracing::debug!("Skipping control process start: no longer an active master");
            return;
        }
        let Some(session) = self.session() else {
            return;
        };

        match supervisor
            .start_control_process(&session.control_path, &session.control_options)
            .await
        {
            Ok(()) => {
                self.control_running.store(true, Ordering::SeqCst);
                self.degraded.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                self.report("Master could not start the control process", &e);
                self.degraded.store(true, Ordering::SeqCst);
            }
        }
    }

    async fn stop_control(&self, supervisor: &dyn ControlProcessSupervisor) {
        self.degraded.store(false, Ordering::SeqCst);
        if !self.control_running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = supervisor.stop_control_process().await {
            self.report("Failed to stop the control process", &e);
        }
    }

    /// Stop the control process, then leave the group
    async fn shutdown(&self, supervisor: &dyn ControlProcessSupervisor, reason: &str) {
        let leaving = self.lifecycle.send_if_modified(|state| match state {
            LifecycleState::Leaving | LifecycleState::Detached => false,
            _ => {
                *state = LifecycleState::Leaving;
                true
            }
        });
        if !leaving {
            return;
        }

        tracing::info!("Leaving group ({})", reason);
        self.stop_control(supervisor).await;

        if let Some(channel) = self.take_channel() {
            if let Err(e) = channel.close().await {
                self.report("Failed to close group channel", &e);
            }
        }

        self.lifecycle.send_replace(LifecycleState::Detached);
        tracing::info!("Node detached from group");
    }

    /// Undo a partial `start`
    async fn abort_start(&self) {
        self.lifecycle.send_replace(LifecycleState::Uninitialized);
        if let Some(channel) = self.take_channel() {
            if let Err(e) = channel.close().await {
                tracing::warn!("Failed to close channel after aborted start: {}", e);
            }
        }
        *lock(&self.elector) = MasterElector::new();
        self.settling.store(false, Ordering::SeqCst);
        self.command(SupervisorCommand::Stop);
    }
}

/// Serialises control-process work in arrival order
async fn run_supervisor(
    shared: Weak<Shared>,
    supervisor: Arc<dyn ControlProcessSupervisor>,
    mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
) {
    while let Some(command) = commands.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match command {
            SupervisorCommand::Start => shared.start_control(supervisor.as_ref()).await,
            SupervisorCommand::Stop => shared.stop_control(supervisor.as_ref()).await,
            SupervisorCommand::Shutdown { reason, done } => {
                shared.shutdown(supervisor.as_ref(), reason).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }
    tracing::debug!("Supervisor task finished");
}

/// The capability registered with the transport
struct Handlers {
    shared: Weak<Shared>,
}

impl Receiver for Handlers {
    fn on_view(&self, members: Vec<Member>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_view(members);
        }
    }

    fn on_suspect(&self, address: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_suspect(address);
        }
    }

    fn on_recover(&self, address: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_recover(address);
        }
    }

    fn on_message(&self, from: &str, payload: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_message(from, payload);
        }
    }
}

/// One node's membership in the controller group
pub struct Coordinator {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Create an idle coordinator
    ///
    /// Spawns the supervisor task, so this must run inside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, supervisor: Arc<dyn ControlProcessSupervisor>) -> Self {
        let tracker = Arc::new(MembershipTracker::new());
        let (lifecycle, _) = watch::channel(LifecycleState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            detector: FailureDetector::new(Arc::clone(&tracker)),
            tracker,
            elector: Mutex::new(MasterElector::new()),
            exchange: Arc::new(NodeInfoExchange::new()),
            lifecycle,
            events,
            session: Mutex::new(None),
            channel: Mutex::new(None),
            commands,
            control_running: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            settling: AtomicBool::new(false),
        });

        tokio::spawn(run_supervisor(Arc::downgrade(&shared), supervisor, command_rx));

        Self { transport, shared }
    }

    /// Join the group and wait for the first view
    ///
    /// Every failure is returned as `Error::ClientConstructor` wrapping the
    /// cause; the node is left `Uninitialized` with no channel open.
    pub async fn start(&self, config: &CtlGroupConfig) -> Result<()> {
        self.try_start(config).await.map_err(|e| {
            tracing::error!("Failed to start node: {}", e);
            Error::ClientConstructor(Box::new(e))
        })
    }

    async fn try_start(&self, config: &CtlGroupConfig) -> Result<()> {
        config.validate()?;

        let claimed = self.shared.lifecycle.send_if_modified(|state| {
            if *state == LifecycleState::Uninitialized {
                *state = LifecycleState::Joining;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(Error::Transport(format!("Node is already {}", self.lifecycle())));
        }

        let session = Arc::new(Session {
            identity: Identity {
                id: NodeId(config.node.id),
                name: config.node.name.clone(),
            },
            group: config.group.name.clone(),
            control_path: config.control.path.clone(),
            control_options: config.control.components.clone(),
            settle: config.settle_delay(),
        });
        *lock(&self.shared.session) = Some(Arc::clone(&session));

        tracing::info!(
            "Joining group {} at {} as {}#{}",
            config.group.name,
            config.group.address,
            session.identity.name,
            session.identity.id
        );

        let group = GroupSpec {
            name: config.group.name.clone(),
            address: config.group.address.clone(),
        };
        let handlers = Arc::new(Handlers {
            shared: Arc::downgrade(&self.shared),
        });

        let channel = match self.transport.join(&group, &session.identity, handlers).await {
            Ok(channel) => channel,
            Err(e) => {
                self.shared.abort_start().await;
                return Err(e);
            }
        };
        *lock(&self.shared.channel) = Some(channel);

        let mut lifecycle = self.shared.lifecycle.subscribe();
        let joined = tokio::time::timeout(
            config.join_timeout(),
            lifecycle.wait_for(|state| *state == LifecycleState::Active),
        )
        .await
        .map(|active| active.is_ok());

        match joined {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.shared.abort_start().await;
                Err(Error::Transport("Lifecycle channel closed while joining".into()))
            }
            Err(_) => {
                self.shared.abort_start().await;
                Err(Error::Transport(format!(
                    "No view received from group {} within {:?}",
                    config.group.name,
                    config.join_timeout()
                )))
            }
        }
    }

    /// Stop the control process and leave the group; idempotent
    pub async fn stop(&self) -> Result<()> {
        let (done, finished) = oneshot::channel();
        self.shared.command(SupervisorCommand::Shutdown {
            reason: "stop requested",
            done: Some(done),
        });

        if finished.await.is_err() {
            return Err(Error::ControlProcess("Supervisor task ended before shutdown finished".into()));
        }
        Ok(())
    }

    /// Ask `node_id` to leave the group
    ///
    /// Fire-and-forget: `Ok` means the request was handed to the transport,
    /// not that the target left.
    pub fn detach(&self, node_id: NodeId) -> Result<()> {
        if self.lifecycle() != LifecycleState::Active {
            return Err(Error::Detach(format!("Node is {}, not active", self.lifecycle())));
        }

        let view = self.shared.tracker.current();
        let target = view.get(node_id).ok_or_else(|| {
            Error::Detach(format!("Node {} is not in view {}", node_id, view.generation()))
        })?;
        let channel = self
            .shared
            .channel()
            .ok_or_else(|| Error::Detach("Group channel is closed".into()))?;

        let payload = Message::Terminate { target_node_id: node_id }
            .encode()
            .map_err(|e| Error::Detach(format!("Failed to encode terminate: {}", e)))?;

        tracing::info!("Sending terminate to {}#{} at {}", target.name, target.id, target.address);
        if let Err(e) = channel.send(Destination::Node(target.address.clone()), payload) {
            tracing::warn!("Terminate for {} may not have been sent: {}", node_id, e);
        }
        Ok(())
    }

    /// Collect node info from the group for at most `timeout`
    pub async fn refresh(&self, timeout: Duration) -> Result<Vec<NodeInfoResponse>> {
        if self.lifecycle() != LifecycleState::Active {
            return Err(Error::Refresh(format!("Node is {}, not active", self.lifecycle())));
        }
        let channel = self
            .shared
            .channel()
            .ok_or_else(|| Error::Refresh("Group channel is closed".into()))?;

        let view = self.shared.tracker.current();
        self.shared.exchange.refresh(channel.as_ref(), &view, timeout).await
    }

    /// Subscribe to cluster events
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.shared.events.subscribe()
    }

    /// Subscribe to lifecycle transitions
    pub fn watch_lifecycle(&self) -> watch::Receiver<LifecycleState> {
        self.shared.lifecycle.subscribe()
    }

    /// The currently installed view
    pub fn view(&self) -> Arc<View> {
        self.shared.tracker.current()
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.shared.lifecycle()
    }

    pub fn local_id(&self) -> Option<NodeId> {
        self.shared.local_id()
    }

    /// This node's transport address while joined
    pub fn local_address(&self) -> Option<String> {
        self.shared.channel().map(|c| c.local_address().to_string())
    }

    /// Check if this node won the last election
    pub fn is_master(&self) -> bool {
        self.shared.is_master()
    }

    pub fn status(&self) -> NodeStatus {
        let session = self.shared.session();
        let view = self.view();
        let election_generation = lock(&self.shared.elector).state().generation;

        NodeStatus {
            lifecycle: self.lifecycle(),
            node_id: session.as_ref().map(|s| s.identity.id),
            name: session.as_ref().map(|s| s.identity.name.clone()),
            address: self.local_address(),
            group: session.as_ref().map(|s| s.group.clone()),
            master: view.master().cloned(),
            is_master: self.is_master(),
            control_running: self.shared.control_running.load(Ordering::SeqCst),
            degraded: self.shared.degraded.load(Ordering::SeqCst),
            election_generation,
            refreshes_in_flight: self.shared.exchange.in_flight(),
            view: View::clone(&view),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let Some(channel) = self.shared.take_channel() else {
            return;
        };
        // Leave the group even if `stop` was never called
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = channel.close().await {
                    tracing::warn!("Failed to close group channel on drop: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use async_trait::async_trait;
    use std::path::Path;

    const GROUP: &str = "sdn-controllers";

    /// Records control-process calls instead of spawning anything
    #[derive(Default)]
    struct RecordingSupervisor {
        calls: Mutex<Vec<&'static str>>,
        fail_start: bool,
    }

    impl RecordingSupervisor {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ControlProcessSupervisor for RecordingSupervisor {
        async fn start_control_process(&self, _path: &Path, _options: &[String]) -> Result<()> {
            self.calls.lock().unwrap().push("start");
            if self.fail_start {
                return Err(Error::ControlProcess("pox.py not found".into()));
            }
            Ok(())
        }

        async fn stop_control_process(&self) -> Result<()> {
            self.calls.lock().unwrap().push("stop");
            Ok(())
        }
    }

    /// Transport whose group never delivers a view
    #[derive(Default)]
    struct SilentTransport {
        closed: Arc<AtomicBool>,
    }

    struct SilentChannel {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Channel for SilentChannel {
        fn local_address(&self) -> &str {
            "silent://node"
        }

        fn send(&self, _destination: Destination, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for SilentTransport {
        async fn join(
            &self,
            _group: &GroupSpec,
            _local: &Identity,
            _receiver: Arc<dyn Receiver>,
        ) -> Result<Arc<dyn Channel>> {
            Ok(Arc::new(SilentChannel {
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    fn config(id: u64, name: &str) -> CtlGroupConfig {
        CtlGroupConfig::from_str(&format!(
            r#"
[node]
id = {id}
name = "{name}"

[group]
name = "{GROUP}"
heartbeat_interval_ms = 50
suspect_timeout_ms = 150
view_timeout_ms = 300
join_timeout_ms = 500
settle_ms = 300

[control]
path = "/opt/pox"
components = ["forwarding.l2_learning"]
"#
        ))
        .unwrap()
    }

    struct TestNode {
        coordinator: Coordinator,
        supervisor: Arc<RecordingSupervisor>,
    }

    impl TestNode {
        fn address(&self) -> String {
            self.coordinator.local_address().unwrap()
        }

        fn master(&self) -> Option<NodeId> {
            self.coordinator.view().master().map(|n| n.id)
        }
    }

    async fn start_node(network: &MemoryNetwork, id: u64, name: &str) -> TestNode {
        let supervisor = Arc::new(RecordingSupervisor::default());
        let coordinator = Coordinator::new(Arc::new(network.transport()), supervisor.clone());
        coordinator.start(&config(id, name)).await.unwrap();
        TestNode { coordinator, supervisor }
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// A(3), B(1), C(2) with everyone agreeing on B
    async fn three_nodes(network: &MemoryNetwork) -> (TestNode, TestNode, TestNode) {
        let a = start_node(network, 3, "ctl-a").await;
        let b = start_node(network, 1, "ctl-b").await;
        let c = start_node(network, 2, "ctl-c").await;

        eventually("three-member views", || {
            [&a, &b, &c].iter().all(|n| n.coordinator.view().len() == 3)
        })
        .await;
        eventually("agreement on master 1", || {
            [&a, &b, &c].iter().all(|n| n.master() == Some(NodeId(1)))
        })
        .await;

        (a, b, c)
    }

    #[tokio::test]
    async fn test_lowest_id_drives_control_process() {
        let network = MemoryNetwork::new();
        let (a, b, c) = three_nodes(&network).await;

        eventually("master starts control", || b.supervisor.calls() == ["start"]).await;
        assert!(b.coordinator.is_master());
        assert!(b.coordinator.status().control_running);
        assert!(!a.coordinator.is_master());
        assert!(c.supervisor.calls().is_empty());

        // A was alone in the group at first but B arrived before it elected
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(a.supervisor.calls().is_empty());
        assert!(!a.coordinator.status().control_running);

        let view = a.coordinator.view();
        assert_eq!(view.members().iter().filter(|n| n.is_master).count(), 1);
        assert_eq!(a.coordinator.lifecycle(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_master_suspicion_and_removal() {
        let network = MemoryNetwork::new();
        let (a, b, c) = three_nodes(&network).await;
        let mut events = a.coordinator.subscribe();
        let generation = a.coordinator.view().generation();

        network.suspect(GROUP, &b.address());
        eventually("re-election after suspicion", || {
            a.master() == Some(NodeId(2)) && c.master() == Some(NodeId(2))
        })
        .await;
        assert_eq!(a.coordinator.view().generation(), generation);
        eventually("new master starts control", || c.supervisor.calls() == ["start"]).await;

        let mut saw_suspicion = false;
        while let Ok(event) = events.try_recv() {
            if let ClusterEvent::NodeSuspected(node) = event {
                assert_eq!(node.id, NodeId(1));
                saw_suspicion = true;
            }
        }
        assert!(saw_suspicion);

        // The transport then drops B; C stays master
        network.crash(GROUP, &b.address());
        eventually("view without B", || a.coordinator.view().len() == 2).await;
        assert_eq!(a.master(), Some(NodeId(2)));
        assert!(a.coordinator.view().generation() > generation);
        assert_eq!(c.supervisor.calls(), ["start"]);
    }

    #[tokio::test]
    async fn test_lone_node_waits_before_electing() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1, "ctl-a").await;

        assert_eq!(a.coordinator.lifecycle(), LifecycleState::Active);
        assert!(!a.coordinator.is_master());
        assert!(a.supervisor.calls().is_empty());

        eventually("lone node elects itself", || a.coordinator.is_master()).await;
        eventually("control started", || a.supervisor.calls() == ["start"]).await;
        assert_eq!(a.master(), Some(NodeId(1)));
    }

    #[tokio::test]
    async fn test_suspicion_survives_unrelated_join() {
        let network = MemoryNetwork::new();
        let (a, b, c) = three_nodes(&network).await;

        network.suspect(GROUP, &b.address());
        eventually("C takes over", || {
            a.master() == Some(NodeId(2)) && c.master() == Some(NodeId(2))
        })
        .await;
        eventually("C starts control", || c.supervisor.calls() == ["start"]).await;

        // A new member changes the view while B is still silent
        let _d = start_node(&network, 5, "ctl-d").await;
        eventually("four-member views", || {
            [&a, &c].iter().all(|n| n.coordinator.view().len() == 4)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(a.master(), Some(NodeId(2)));
        assert_eq!(c.master(), Some(NodeId(2)));
        assert!(c.coordinator.view().get(NodeId(1)).unwrap().suspected);
        assert_eq!(c.supervisor.calls(), ["start"]);

        // B is heard from again and outranks C
        network.recover(GROUP, &b.address());
        eventually("B is master again", || {
            a.master() == Some(NodeId(1)) && c.master() == Some(NodeId(1))
        })
        .await;
        eventually("C hands control back", || c.supervisor.calls() == ["start", "stop"]).await;
        assert!(!c.coordinator.view().get(NodeId(1)).unwrap().suspected);
    }

    #[tokio::test]
    async fn test_stop_while_master() {
        let network = MemoryNetwork::new();
        let (a, b, c) = three_nodes(&network).await;
        eventually("master starts control", || b.supervisor.calls() == ["start"]).await;

        b.coordinator.stop().await.unwrap();
        assert_eq!(b.coordinator.lifecycle(), LifecycleState::Detached);
        assert_eq!(b.supervisor.calls(), ["start", "stop"]);
        assert!(b.coordinator.local_address().is_none());

        b.coordinator.stop().await.unwrap();
        assert_eq!(b.supervisor.calls(), ["start", "stop"]);

        eventually("survivors elect C", || {
            a.master() == Some(NodeId(2)) && c.master() == Some(NodeId(2))
        })
        .await;
        eventually("C starts control", || c.supervisor.calls() == ["start"]).await;
    }

    #[tokio::test]
    async fn test_remote_terminate() {
        let network = MemoryNetwork::new();
        let (a, _b, c) = three_nodes(&network).await;

        a.coordinator.detach(NodeId(2)).unwrap();
        eventually("C detached", || c.coordinator.lifecycle() == LifecycleState::Detached).await;
        eventually("A sees C leave", || !a.coordinator.view().contains(NodeId(2))).await;
        assert!(c.supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_detach_is_best_effort() {
        let network = MemoryNetwork::new();
        let (a, _b, c) = three_nodes(&network).await;

        network.block(&c.address());
        a.coordinator.detach(NodeId(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.coordinator.lifecycle(), LifecycleState::Active);

        // Nothing was queued for redelivery; a second request gets through
        network.unblock(&c.address());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(c.coordinator.lifecycle(), LifecycleState::Active);
        a.coordinator.detach(NodeId(2)).unwrap();
        eventually("C detached", || c.coordinator.lifecycle() == LifecycleState::Detached).await;

        let err = a.coordinator.detach(NodeId(99)).unwrap_err();
        assert!(matches!(err, Error::Detach(_)));
    }

    #[tokio::test]
    async fn test_refresh_collects_reachable_members() {
        let network = MemoryNetwork::new();
        let (a, _b, c) = three_nodes(&network).await;

        let all = a.coordinator.refresh(Duration::from_secs(2)).await.unwrap();
        let ids: Vec<NodeId> = all.iter().map(|r| r.node_id).collect();
        assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert_eq!(all.iter().filter(|r| r.is_master).count(), 1);
        assert!(all.iter().all(|r| r.cluster_name == GROUP));

        network.block(&c.address());
        let partial = a.coordinator.refresh(Duration::from_millis(200)).await.unwrap();
        assert_eq!(partial.len(), 2);
        assert!(partial.iter().all(|r| r.node_id != NodeId(2)));
    }

    #[tokio::test]
    async fn test_refresh_from_isolated_node_times_out_empty() {
        let network = MemoryNetwork::new();
        let (a, _b, _c) = three_nodes(&network).await;

        network.block(&a.address());
        let started = std::time::Instant::now();
        let result = a.coordinator.refresh(Duration::from_millis(200)).await.unwrap();
        assert!(result.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_operations_require_active_node() {
        let network = MemoryNetwork::new();
        let coordinator = Coordinator::new(
            Arc::new(network.transport()),
            Arc::new(RecordingSupervisor::default()),
        );

        assert!(matches!(
            coordinator.refresh(Duration::from_millis(10)).await,
            Err(Error::Refresh(_))
        ));
        assert!(matches!(coordinator.detach(NodeId(1)), Err(Error::Detach(_))));
        assert_eq!(coordinator.status().lifecycle, LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn test_bad_group_address_fails_start() {
        let network = MemoryNetwork::new();
        let supervisor = Arc::new(RecordingSupervisor::default());
        let coordinator = Coordinator::new(Arc::new(network.transport()), supervisor.clone());

        let mut config = config(1, "ctl-a");
        config.group.address = "not-an-address".to_string();

        let err = coordinator.start(&config).await.unwrap_err();
        assert!(matches!(err, Error::ClientConstructor(_)));
        assert!(matches!(err.root(), Error::Config(_)));
        assert_eq!(coordinator.lifecycle(), LifecycleState::Uninitialized);
        assert!(network.members(GROUP).is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(supervisor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_join_fails_start() {
        let network = MemoryNetwork::new();
        network.reject_joins(true);
        let coordinator = Coordinator::new(
            Arc::new(network.transport()),
            Arc::new(RecordingSupervisor::default()),
        );

        let err = coordinator.start(&config(1, "ctl-a")).await.unwrap_err();
        assert!(matches!(err.root(), Error::Transport(_)));
        assert_eq!(coordinator.lifecycle(), LifecycleState::Uninitialized);

        // The node can try again once the group accepts it
        network.reject_joins(false);
        coordinator.start(&config(1, "ctl-a")).await.unwrap();
        assert_eq!(coordinator.lifecycle(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_missing_view_times_out() {
        let transport = Arc::new(SilentTransport::default());
        let closed = Arc::clone(&transport.closed);
        let coordinator = Coordinator::new(transport, Arc::new(RecordingSupervisor::default()));

        let err = coordinator.start(&config(1, "ctl-a")).await.unwrap_err();
        assert!(matches!(err, Error::ClientConstructor(_)));
        assert!(matches!(err.root(), Error::Transport(_)));
        assert!(closed.load(Ordering::SeqCst));
        assert!(coordinator.local_address().is_none());
        assert_eq!(coordinator.lifecycle(), LifecycleState::Uninitialized);
    }

    #[tokio::test]
    async fn test_control_failure_degrades_master() {
        let network = MemoryNetwork::new();
        let supervisor = Arc::new(RecordingSupervisor {
            fail_start: true,
            ..Default::default()
        });
        let coordinator = Coordinator::new(Arc::new(network.transport()), supervisor.clone());
        let mut events = coordinator.subscribe();

        coordinator.start(&config(1, "ctl-a")).await.unwrap();
        eventually("degraded status", || coordinator.status().degraded).await;

        let status = coordinator.status();
        assert!(status.is_master);
        assert!(!status.control_running);

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ClusterEvent::Error { kind, .. } = event {
                kinds.push(kind);
            }
        }
        assert_eq!(kinds, vec![ErrorKind::ControlProcess]);
    }

    #[tokio::test]
    async fn test_undecodable_message_becomes_error_event() {
        let network = MemoryNetwork::new();
        let a = start_node(&network, 1, "ctl-a").await;
        let mut events = a.coordinator.subscribe();

        // A raw member of the same group that speaks garbage
        let intruder = network
            .transport()
            .join(
                &GroupSpec {
                    name: GROUP.to_string(),
                    address: "228.8.8.8:45588".to_string(),
                },
                &Identity {
                    id: NodeId(9),
                    name: "intruder".to_string(),
                },
                Arc::new(Handlers { shared: Weak::new() }),
            )
            .await
            .unwrap();
        intruder
            .send(Destination::Node(a.address()), b"not json".to_vec())
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(ClusterEvent::Error { kind, .. }) = events.recv().await {
                    return kind;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(event, ErrorKind::Protocol);
        assert_eq!(a.coordinator.lifecycle(), LifecycleState::Active);
    }
}
