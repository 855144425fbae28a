use std::net::SocketAddr;

use actornet_shared::{ChannelId, ErrorCode, Millis, TransportKind};

use crate::channel::{ChannelError, ChannelInfo};

/// Something that happened on one of a service's channels
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A peer connected to the listener
    Accepted {
        channel_id: ChannelId,
        remote: SocketAddr,
    },
    /// An outgoing channel finished connecting
    Connected {
        channel_id: ChannelId,
        remote: SocketAddr,
    },
    /// Exactly one de-framed message (opcode + body)
    Read {
        channel_id: ChannelId,
        frame: Vec<u8>,
    },
    /// The channel failed. Raised at most once per channel; the owner is
    /// expected to `remove` it afterwards.
    Error {
        channel_id: ChannelId,
        error: ErrorCode,
    },
}

impl ServiceEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ServiceEvent::Accepted { channel_id, .. }
            | ServiceEvent::Connected { channel_id, .. }
            | ServiceEvent::Read { channel_id, .. }
            | ServiceEvent::Error { channel_id, .. } => *channel_id,
        }
    }
}

/// Owner of every channel of one transport kind.
///
/// Services never call back into their owner: events are queued and drained by
/// `receive`, on the owning fiber.
pub trait Service: Send {
    fn kind(&self) -> TransportKind;

    /// Address the listener is bound to, if this service accepts connections
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Creates an outgoing channel and starts connecting it. Frames sent before
    /// the connect completes are queued.
    fn connect_channel(&mut self, address: SocketAddr) -> Result<ChannelId, ChannelError>;

    /// Enqueues one frame (opcode + body). Never blocks.
    fn send(&mut self, channel_id: ChannelId, frame: &[u8]) -> Result<(), ChannelError>;

    /// Detaches and closes a channel. Unknown ids are ignored.
    fn remove(&mut self, channel_id: ChannelId);

    /// Drives transports that need polling. Others ignore it.
    fn update(&mut self, _now: Millis) {}

    /// Next pending event, if any
    fn receive(&mut self) -> Option<ServiceEvent>;

    fn channel(&self, channel_id: ChannelId) -> Option<&ChannelInfo>;

    fn channel_ids(&self) -> Vec<ChannelId>;

    /// Removes every channel and refuses further connects and sends
    fn dispose(&mut self);

    fn is_disposed(&self) -> bool;
}
