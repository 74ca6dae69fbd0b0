//! Transport Module
//!
//! The group-communication boundary: joining a named group, best-effort
//! unicast/broadcast datagrams, and ordered view-change and suspicion
//! callbacks delivered to a single registered `Receiver`.

mod memory;
mod udp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::{UdpSettings, UdpTransport};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::state::{Member, NodeId};

/// Group to join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Group name; members of other groups are invisible
    pub name: String,
    /// Transport-specific group address
    pub address: String,
}

/// Identity announced by the joining node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: NodeId,
    pub name: String,
}

/// Datagram destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every member of the group, including the sender
    Broadcast,
    /// A single member by transport address
    Node(String),
}

/// Callbacks registered once at join time
///
/// A transport invokes these from one task per joined channel, in order and
/// never concurrently. Implementations must return quickly.
pub trait Receiver: Send + Sync {
    /// The full current member list (order unspecified)
    fn on_view(&self, members: Vec<Member>);

    /// The member at `address` may be unreachable
    ///
    /// Reported once per outage. The suspicion holds across later views
    /// until `on_recover` or until the member leaves the view.
    fn on_suspect(&self, address: &str);

    /// A suspected member at `address` was heard from again
    fn on_recover(&self, address: &str);

    /// A datagram from `from`
    fn on_message(&self, from: &str, payload: &[u8]);
}

/// An open group membership
#[async_trait]
pub trait Channel: Send + Sync {
    /// This member's transport address
    fn local_address(&self) -> &str;

    /// Queue a datagram; delivery is not confirmed
    fn send(&self, destination: Destination, payload: Vec<u8>) -> Result<()>;

    /// Leave the group and release transport resources
    async fn close(&self) -> Result<()>;
}

/// Group-communication service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Join `group` as `local`, delivering callbacks to `receiver`
    async fn join(
        &self,
        group: &GroupSpec,
        local: &Identity,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<dyn Channel>>;
}

/// Frame header for checksummed datagrams
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

/// Wrap a body in a checksummed frame
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(body);
    let mut frame = Vec::with_capacity(FrameHeader::SIZE + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Validate a frame and return its body
pub fn decode_frame(frame: &[u8]) -> Result<&[u8]> {
    let (head, body) = frame
        .split_first_chunk::<{ FrameHeader::SIZE }>()
        .ok_or_else(|| Error::Transport(format!("Short frame ({} bytes)", frame.len())))?;
    let header = FrameHeader::from_bytes(head);

    if header.length as usize != body.len() {
        return Err(Error::Transport(format!(
            "Frame length mismatch: header says {}, got {}",
            header.length,
            body.len()
        )));
    }

    if crc32fast::hash(body) != header.checksum {
        return Err(Error::Transport("Frame checksum mismatch".into()));
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_frame_rejects_corruption() {
        let mut frame = encode_frame(b"heartbeat");
        assert_eq!(decode_frame(&frame).unwrap(), b"heartbeat");

        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(decode_frame(&frame).is_err());

        assert!(decode_frame(&frame[..4]).is_err());
        assert!(decode_frame(&frame[..frame.len() - 2]).is_err());
    }
}
