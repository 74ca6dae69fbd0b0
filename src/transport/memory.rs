//! In-Memory Group Transport
//!
//! Runs any number of group members inside one process. Each joined member
//! gets its own delivery task, so callbacks are ordered per member exactly
//! like a real group service. Fault injection hooks let tests suspect,
//! recover, crash, or silence members.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Channel, Destination, GroupSpec, Identity, Receiver, Transport};
use crate::error::{Error, Result};
use crate::state::Member;

/// Event queued for one member's delivery task
enum Delivery {
    View(Vec<Member>),
    Suspect(String),
    Recover(String),
    Message { from: String, payload: Vec<u8> },
}

struct Endpoint {
    member: Member,
    queue: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct Hub {
    groups: HashMap<String, Vec<Endpoint>>,
    blocked: HashSet<String>,
    reject_joins: bool,
    next_port: u64,
}

impl Hub {
    /// Deliver the current member list to every member of `group`
    fn publish_view(&self, group: &str) {
        let Some(endpoints) = self.groups.get(group) else {
            return;
        };
        let members: Vec<Member> = endpoints.iter().map(|e| e.member.clone()).collect();
        for endpoint in endpoints {
            let _ = endpoint.queue.send(Delivery::View(members.clone()));
        }
    }

    fn remove(&mut self, group: &str, address: &str) -> bool {
        let Some(endpoints) = self.groups.get_mut(group) else {
            return false;
        };
        let before = endpoints.len();
        endpoints.retain(|e| e.member.address != address);
        before != endpoints.len()
    }
}

/// Shared in-process network; clone it to hand out transports
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport attached to this network
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
        }
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Addresses of the current members of `group`, in join order
    pub fn members(&self, group: &str) -> Vec<Member> {
        self.hub()
            .groups
            .get(group)
            .map(|endpoints| endpoints.iter().map(|e| e.member.clone()).collect())
            .unwrap_or_default()
    }

    /// Report `address` as suspected to every other member of `group`
    pub fn suspect(&self, group: &str, address: &str) {
        self.notify_others(group, address, || Delivery::Suspect(address.to_string()));
    }

    /// Report `address` as reachable again to every other member of `group`
    pub fn recover(&self, group: &str, address: &str) {
        self.notify_others(group, address, || Delivery::Recover(address.to_string()));
    }

    fn notify_others(&self, group: &str, address: &str, delivery: impl Fn() -> Delivery) {
        let hub = self.hub();
        if let Some(endpoints) = hub.groups.get(group) {
            for endpoint in endpoints.iter().filter(|e| e.member.address != address) {
                let _ = endpoint.queue.send(delivery());
            }
        }
    }

    /// Drop `address` from `group` without a goodbye, as if its process died
    pub fn crash(&self, group: &str, address: &str) {
        let mut hub = self.hub();
        if hub.remove(group, address) {
            hub.publish_view(group);
        }
    }

    /// Silently drop every datagram to or from `address`
    pub fn block(&self, address: &str) {
        self.hub().blocked.insert(address.to_string());
    }

    /// Undo `block`
    pub fn unblock(&self, address: &str) {
        self.hub().blocked.remove(address);
    }

    /// Make subsequent joins fail
    pub fn reject_joins(&self, reject: bool) {
        self.hub().reject_joins = reject;
    }
}

/// Transport handle over a `MemoryNetwork`
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn join(
        &self,
        group: &GroupSpec,
        local: &Identity,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Channel>> {
        let (queue, mut deliveries) = mpsc::unbounded_channel();

        let address = {
            let mut hub = self.network.hub();
            if hub.reject_joins {
                return Err(Error::Transport(format!("Group '{}' refused join", group.name)));
            }

            hub.next_port += 1;
            let address = format!("mem://{}/{}:{}", group.name, local.name, hub.next_port);
            let member = Member::new(local.id, local.name.clone(), address.clone());
            hub.groups
                .entry(group.name.clone())
                .or_default()
                .push(Endpoint { member, queue });
            hub.publish_view(&group.name);
            address
        };

        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                match delivery {
                    Delivery::View(members) => receiver.on_view(members),
                    Delivery::Suspect(address) => receiver.on_suspect(&address),
                    Delivery::Recover(address) => receiver.on_recover(&address),
                    Delivery::Message { from, payload } => receiver.on_message(&from, &payload),
                }
            }
        });

        tracing::debug!("Joined in-memory group {} as {}", group.name, address);

        Ok(Arc::new(MemoryChannel {
            network: self.network.clone(),
            group: group.name.clone(),
            address,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryChannel {
    network: MemoryNetwork,
    group: String,
    address: String,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn local_address(&self) -> &str {
        &self.address
    }

    fn send(&self, destination: Destination, payload: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("Channel is closed".into()));
        }

        let hub = self.network.hub();
        let Some(endpoints) = hub.groups.get(&self.group) else {
            return Ok(());
        };

        // Crashed or blocked senders lose their datagrams
        if hub.blocked.contains(&self.address)
            || !endpoints.iter().any(|e| e.member.address == self.address)
        {
            return Ok(());
        }

        let targets = endpoints.iter().filter(|e| match &destination {
            Destination::Broadcast => true,
            Destination::Node(address) => &e.member.address == address,
        });

        for endpoint in targets.filter(|e| !hub.blocked.contains(&e.member.address)) {
            let _ = endpoint.queue.send(Delivery::Message {
                from: self.address.clone(),
                payload: payload.clone(),
            });
        }

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut hub = self.network.hub();
        if hub.remove(&self.group, &self.address) {
            hub.publish_view(&self.group);
        }
        tracing::debug!("Left in-memory group {} ({})", self.group, self.address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeId;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        views: Mutex<Vec<Vec<Member>>>,
        suspects: Mutex<Vec<String>>,
        recoveries: Mutex<Vec<String>>,
        messages: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Receiver for Recorder {
        fn on_view(&self, members: Vec<Member>) {
            self.views.lock().unwrap().push(members);
        }

        fn on_suspect(&self, address: &str) {
            self.suspects.lock().unwrap().push(address.to_string());
        }

        fn on_recover(&self, address: &str) {
            self.recoveries.lock().unwrap().push(address.to_string());
        }

        fn on_message(&self, from: &str, payload: &[u8]) {
            self.messages.lock().unwrap().push((from.to_string(), payload.to_vec()));
        }
    }

    fn group() -> GroupSpec {
        GroupSpec {
            name: "test".to_string(),
            address: "228.8.8.8:45588".to_string(),
        }
    }

    fn identity(id: u64, name: &str) -> Identity {
        Identity {
            id: NodeId(id),
            name: name.to_string(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_views_and_broadcast() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        let chan_a = transport.join(&group(), &identity(1, "a"), a.clone()).await.unwrap();
        let chan_b = transport.join(&group(), &identity(2, "b"), b.clone()).await.unwrap();
        settle().await;

        assert_eq!(a.views.lock().unwrap().len(), 2);
        assert_eq!(b.views.lock().unwrap().last().unwrap().len(), 2);

        chan_a.send(Destination::Broadcast, b"hello".to_vec()).unwrap();
        chan_b.send(Destination::Node(chan_a.local_address().to_string()), b"direct".to_vec()).unwrap();
        settle().await;

        assert_eq!(a.messages.lock().unwrap().len(), 2);
        assert_eq!(b.messages.lock().unwrap().len(), 1);
        assert_eq!(b.messages.lock().unwrap()[0].0, chan_a.local_address());
    }

    #[tokio::test]
    async fn test_close_and_crash_publish_views() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let a = Arc::new(Recorder::default());

        let _chan_a = transport.join(&group(), &identity(1, "a"), a.clone()).await.unwrap();
        let chan_b = transport.join(&group(), &identity(2, "b"), Arc::new(Recorder::default())).await.unwrap();
        let chan_c = transport.join(&group(), &identity(3, "c"), Arc::new(Recorder::default())).await.unwrap();

        chan_b.close().await.unwrap();
        chan_b.close().await.unwrap();
        assert!(chan_b.send(Destination::Broadcast, Vec::new()).is_err());

        network.crash("test", chan_c.local_address());
        settle().await;

        let views = a.views.lock().unwrap();
        assert_eq!(views.len(), 5);
        assert_eq!(views.last().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_block_and_suspect() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        let chan_a = transport.join(&group(), &identity(1, "a"), a.clone()).await.unwrap();
        let chan_b = transport.join(&group(), &identity(2, "b"), b.clone()).await.unwrap();

        network.block(chan_b.local_address());
        chan_a.send(Destination::Broadcast, b"x".to_vec()).unwrap();
        network.suspect("test", chan_b.local_address());
        settle().await;

        assert_eq!(a.messages.lock().unwrap().len(), 1);
        assert!(b.messages.lock().unwrap().is_empty());
        assert_eq!(a.suspects.lock().unwrap().as_slice(), [chan_b.local_address().to_string()]);
        assert!(b.suspects.lock().unwrap().is_empty());

        network.unblock(chan_b.local_address());
        network.recover("test", chan_b.local_address());
        chan_a.send(Destination::Broadcast, b"y".to_vec()).unwrap();
        settle().await;

        assert_eq!(a.recoveries.lock().unwrap().as_slice(), [chan_b.local_address().to_string()]);
        assert_eq!(b.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_join() {
        let network = MemoryNetwork::new();
        network.reject_joins(true);
        let result = network
            .transport()
            .join(&group(), &identity(1, "a"), Arc::new(Recorder::default()))
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert!(network.members("test").is_empty());
    }
}
