use std::fmt;

use serde::{Deserialize, Serialize};

/// 16-bit message discriminator, the first field of every frame
pub type Opcode = u16;
/// Per-session request correlation id
pub type RpcId = u32;
/// Process-unique channel id; sessions reuse the id of the channel they wrap
pub type ChannelId = u64;
pub type SessionId = u64;
pub type TimerId = u64;
/// Identifies a server process for actor routing
pub type ProcessId = u32;

/// Monotonic time in milliseconds, as reported by a [`Clock`](crate::Clock)
pub type Millis = u64;

/// Fixed-width (96-bit) address of an actor-hosted entity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId {
    /// Process currently hosting the entity
    pub process: ProcessId,
    /// Entity instance id, unique within the whole cluster
    pub instance: u64,
}

impl ActorId {
    pub const WIRE_SIZE: usize = 12;

    pub fn new(process: ProcessId, instance: u64) -> Self {
        Self { process, instance }
    }

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut bytes = [0u8; Self::WIRE_SIZE];
        bytes[..4].copy_from_slice(&self.process.to_le_bytes());
        bytes[4..].copy_from_slice(&self.instance.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut process = [0u8; 4];
        let mut instance = [0u8; 8];
        process.copy_from_slice(&bytes[..4]);
        instance.copy_from_slice(&bytes[4..]);
        Self {
            process: u32::from_le_bytes(process),
            instance: u64::from_le_bytes(instance),
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process, self.instance)
    }
}

/// Which side opened a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Accepted,
    Outgoing,
}

/// Transport a service speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Length-prefixed frames over a TCP stream
    Stream,
    /// Ordered, retransmitting messages over UDP
    ReliableMessage,
    /// One binary WebSocket message per frame
    WebSocket,
    /// In-process transport used by tests and single-process deployments
    Local,
}

impl TransportKind {
    /// Whether the service must be updated every tick to make progress
    pub fn requires_polling(self) -> bool {
        matches!(self, TransportKind::ReliableMessage)
    }
}
