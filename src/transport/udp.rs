//! UDP Multicast Group Transport
//!
//! Members announce themselves with periodic heartbeats to a multicast
//! group address. A member that stays silent past the suspicion timeout is
//! reported as suspected; past the view timeout it is dropped from the view.
//! Application datagrams travel as unicast (or multicast for broadcasts).

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::{decode_frame, encode_frame, Channel, Destination, GroupSpec, Identity, Receiver, Transport};
use crate::config::CtlGroupConfig;
use crate::error::{Error, Result};
use crate::state::Member;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 65_507;

/// Datagrams on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Packet {
    /// Periodic liveness announcement
    Heartbeat { group: String, member: Member },
    /// Application payload
    Data {
        group: String,
        from: String,
        payload: Vec<u8>,
    },
    /// Graceful departure
    Leave { group: String, address: String },
}

impl Packet {
    fn group(&self) -> &str {
        match self {
            Packet::Heartbeat { group, .. } | Packet::Data { group, .. } | Packet::Leave { group, .. } => group,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(encode_frame(&bincode::serialize(self)?))
    }

    fn decode(frame: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(decode_frame(frame)?)?)
    }
}

/// Timing and addressing for the UDP transport
#[derive(Debug, Clone)]
pub struct UdpSettings {
    /// Local unicast bind address
    pub bind_address: String,
    /// Address announced to peers; defaults to the bound address
    pub advertise_address: Option<String>,
    /// Interface for multicast traffic; the system default when None
    pub multicast_interface: Option<Ipv4Addr>,
    pub heartbeat_interval: Duration,
    pub suspect_timeout: Duration,
    pub view_timeout: Duration,
}

impl UdpSettings {
    pub fn from_config(config: &CtlGroupConfig) -> Self {
        Self {
            bind_address: config.node.bind_address.clone(),
            advertise_address: config.node.advertise_address.clone(),
            multicast_interface: config.group.interface,
            heartbeat_interval: config.heartbeat_interval(),
            suspect_timeout: config.suspect_timeout(),
            view_timeout: config.view_timeout(),
        }
    }
}

/// Multicast heartbeat group transport
pub struct UdpTransport {
    settings: UdpSettings,
}

impl UdpTransport {
    pub fn new(settings: UdpSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn join(
        &self,
        group: &GroupSpec,
        local: &Identity,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Channel>> {
        let group_addr = parse_group_address(&group.address)?;

        let interface = self.settings.multicast_interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let multicast = bind_multicast(group_addr, interface)?;
        let unicast = UdpSocket::bind(&self.settings.bind_address).await.map_err(|e| {
            Error::Transport(format!("Failed to bind {}: {}", self.settings.bind_address, e))
        })?;
        if !interface.is_unspecified() {
            socket2::SockRef::from(&unicast)
                .set_multicast_if_v4(&interface)
                .map_err(|e| Error::Transport(format!("Failed to send multicast via {}: {}", interface, e)))?;
        }

        let address = advertised_address(&self.settings, unicast.local_addr()?);
        let member = Member::new(local.id, local.name.clone(), address.clone());

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let group_loop = GroupLoop {
            group: group.name.clone(),
            group_addr: SocketAddr::V4(group_addr),
            member,
            multicast,
            unicast,
            receiver,
            peers: PeerTable::new(self.settings.suspect_timeout, self.settings.view_timeout),
            heartbeat_interval: self.settings.heartbeat_interval,
        };
        let task = tokio::spawn(group_loop.run(outgoing_rx, shutdown_rx));

        tracing::info!("Joined group {} at {} as {}", group.name, group.address, address);

        Ok(Arc::new(UdpChannel {
            address,
            outgoing: outgoing_tx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }))
    }
}

fn parse_group_address(address: &str) -> Result<SocketAddrV4> {
    match address.parse::<SocketAddr>() {
        Ok(SocketAddr::V4(addr)) if addr.ip().is_multicast() => Ok(addr),
        Ok(other) => Err(Error::Transport(format!(
            "{} is not an IPv4 multicast address",
            other
        ))),
        Err(e) => Err(Error::Transport(format!("Invalid group address '{}': {}", address, e))),
    }
}

/// Bind a socket on the group port that several local members can share
fn bind_multicast(group_addr: SocketAddrV4, interface: Ipv4Addr) -> Result<UdpSocket> {
    let transport_err = |what: &str, e: std::io::Error| {
        Error::Transport(format!("Failed to {} for group {}: {}", what, group_addr, e))
    };

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| transport_err("create socket", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| transport_err("set SO_REUSEADDR", e))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| transport_err("set SO_REUSEPORT", e))?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group_addr.port()).into())
        .map_err(|e| transport_err("bind", e))?;
    socket
        .join_multicast_v4(group_addr.ip(), &interface)
        .map_err(|e| transport_err("join multicast", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| transport_err("set non-blocking", e))?;

    UdpSocket::from_std(socket.into()).map_err(|e| transport_err("register socket", e))
}

fn advertised_address(settings: &UdpSettings, bound: SocketAddr) -> String {
    if let Some(address) = &settings.advertise_address {
        return address.clone();
    }
    if bound.ip().is_unspecified() {
        tracing::warn!(
            "Bound to {}; advertising loopback. Set node.advertise_address for multi-host groups",
            bound
        );
        return SocketAddr::new(Ipv4Addr::LOCALHOST.into(), bound.port()).to_string();
    }
    bound.to_string()
}

struct PeerEntry {
    member: Member,
    last_seen: Instant,
    suspected: bool,
}

/// Effect of a heartbeat on the peer table
#[derive(Debug, Default, PartialEq, Eq)]
struct Observation {
    /// The member list changed (new member or new identity)
    view_changed: bool,
    /// The member was suspected until now
    recovered: bool,
}

/// Changes produced by a timeout sweep
#[derive(Debug, Default, PartialEq, Eq)]
struct Sweep {
    suspected: Vec<String>,
    removed: Vec<String>,
}

/// Liveness bookkeeping for remote members
struct PeerTable {
    peers: HashMap<String, PeerEntry>,
    suspect_timeout: Duration,
    view_timeout: Duration,
}

impl PeerTable {
    fn new(suspect_timeout: Duration, view_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            suspect_timeout,
            view_timeout,
        }
    }

    /// Record a heartbeat
    fn observe(&mut self, member: Member, now: Instant) -> Observation {
        match self.peers.get_mut(&member.address) {
            Some(entry) => {
                entry.last_seen = now;
                let recovered = std::mem::take(&mut entry.suspected);
                let view_changed = entry.member != member;
                entry.member = member;
                Observation { view_changed, recovered }
            }
            None => {
                self.peers.insert(
                    member.address.clone(),
                    PeerEntry {
                        member,
                        last_seen: now,
                        suspected: false,
                    },
                );
                Observation {
                    view_changed: true,
                    recovered: false,
                }
            }
        }
    }

    /// Refresh liveness of a known member; returns true when it was suspected
    fn touch(&mut self, address: &str, now: Instant) -> bool {
        match self.peers.get_mut(address) {
            Some(entry) => {
                entry.last_seen = now;
                std::mem::take(&mut entry.suspected)
            }
            None => false,
        }
    }

    fn remove(&mut self, address: &str) -> bool {
        self.peers.remove(address).is_some()
    }

    /// Suspect and drop silent members
    fn sweep(&mut self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();

        for (address, entry) in self.peers.iter_mut() {
            let silence = now.saturating_duration_since(entry.last_seen);
            if silence > self.view_timeout {
                sweep.removed.push(address.clone());
            } else if silence > self.suspect_timeout && !entry.suspected {
                entry.suspected = true;
                sweep.suspected.push(address.clone());
            }
        }

        for address in &sweep.removed {
            self.peers.remove(address);
        }

        sweep.suspected.sort();
        sweep.removed.sort();
        sweep
    }

    /// Current members, local member included
    fn members(&self, local: &Member) -> Vec<Member> {
        std::iter::once(local.clone())
            .chain(self.peers.values().map(|e| e.member.clone()))
            .collect()
    }
}

/// The single task that owns both sockets and drives the receiver
struct GroupLoop {
    group: String,
    group_addr: SocketAddr,
    member: Member,
    multicast: UdpSocket,
    unicast: UdpSocket,
    receiver: Arc<dyn Receiver>,
    peers: PeerTable,
    heartbeat_interval: Duration,
}

impl GroupLoop {
    async fn run(
        mut self,
        mut outgoing: mpsc::UnboundedReceiver<(Destination, Vec<u8>)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        let mut sweep = tokio::time::interval((self.heartbeat_interval / 2).max(Duration::from_millis(10)));
        let mut multicast_buf = vec![0u8; MAX_DATAGRAM];
        let mut unicast_buf = vec![0u8; MAX_DATAGRAM];

        // The local member is always part of its own view
        self.receiver.on_view(self.peers.members(&self.member));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped channel handle also ends the membership
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    let packet = Packet::Heartbeat { group: self.group.clone(), member: self.member.clone() };
                    self.send_packet(&packet, self.group_addr).await;
                }
                _ = sweep.tick() => {
                    let changes = self.peers.sweep(Instant::now());
                    for address in &changes.suspected {
                        self.receiver.on_suspect(address);
                    }
                    if !changes.removed.is_empty() {
                        tracing::info!("Dropping silent member(s) {:?} from group {}", changes.removed, self.group);
                        self.publish_view();
                    }
                }
                received = self.multicast.recv_from(&mut multicast_buf) => {
                    match received {
                        Ok((len, src)) => self.handle_datagram(&multicast_buf[..len], src),
                        Err(e) => tracing::trace!("Multicast recv error: {}", e),
                    }
                }
                received = self.unicast.recv_from(&mut unicast_buf) => {
                    match received {
                        Ok((len, src)) => self.handle_datagram(&unicast_buf[..len], src),
                        Err(e) => tracing::trace!("Unicast recv error: {}", e),
                    }
                }
                Some((destination, payload)) = outgoing.recv() => {
                    self.deliver(destination, payload).await;
                }
            }
        }

        let leave = Packet::Leave { group: self.group.clone(), address: self.member.address.clone() };
        self.send_packet(&leave, self.group_addr).await;
        tracing::info!("Left group {}", self.group);
    }

    fn handle_datagram(&mut self, frame: &[u8], src: SocketAddr) {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Discarding datagram from {}: {}", src, e);
                return;
            }
        };

        if packet.group() != self.group {
            return;
        }

        match packet {
            Packet::Heartbeat { member, .. } => {
                if member.address == self.member.address {
                    return;
                }
                if member.id == self.member.id {
                    tracing::warn!("Member {} at {} reuses our node id {}", member.name, member.address, member.id);
                }
                let address = member.address.clone();
                let observed = self.peers.observe(member, Instant::now());
                if observed.view_changed {
                    self.publish_view();
                }
                if observed.recovered {
                    self.receiver.on_recover(&address);
                }
            }
            Packet::Data { from, payload, .. } => {
                if self.peers.touch(&from, Instant::now()) {
                    self.receiver.on_recover(&from);
                }
                self.receiver.on_message(&from, &payload);
            }
            Packet::Leave { address, .. } => {
                if self.peers.remove(&address) {
                    tracing::info!("Member {} left group {}", address, self.group);
                    self.publish_view();
                }
            }
        }
    }

    async fn deliver(&self, destination: Destination, payload: Vec<u8>) {
        let target = match &destination {
            Destination::Broadcast => self.group_addr,
            Destination::Node(address) => match address.parse::<SocketAddr>() {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::warn!("Dropping datagram to unparseable address {}: {}", address, e);
                    return;
                }
            },
        };

        let packet = Packet::Data {
            group: self.group.clone(),
            from: self.member.address.clone(),
            payload,
        };
        self.send_packet(&packet, target).await;
    }

    async fn send_packet(&self, packet: &Packet, target: SocketAddr) {
        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to encode datagram: {}", e);
                return;
            }
        };
        if let Err(e) = self.unicast.send_to(&frame, target).await {
            tracing::debug!("Send to {} failed: {}", target, e);
        }
    }

    fn publish_view(&self) {
        self.receiver.on_view(self.peers.members(&self.member));
    }
}

struct UdpChannel {
    address: String,
    outgoing: mpsc::UnboundedSender<(Destination, Vec<u8>)>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Channel for UdpChannel {
    fn local_address(&self) -> &str {
        &self.address
    }

    fn send(&self, destination: Destination, payload: Vec<u8>) -> Result<()> {
        self.outgoing
            .send((destination, payload))
            .map_err(|_| Error::Transport("Channel is closed".into()))
    }

    async fn close(&self) -> Result<()> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        let _ = self.shutdown.send(true);
        task.await
            .map_err(|e| Error::Transport(format!("Group task failed: {}", e)))
    }
}
