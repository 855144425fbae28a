//! # Actornet Shared
//! Transport-independent building blocks shared by every actornet service:
//! stream framing, the message envelope, the opcode registry, actor routing and
//! the timer wheel.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod actor_route;
mod clock;
mod codec;
mod config;
mod envelope;
mod error_code;
mod frame;
mod id_generator;
mod message;
mod message_kinds;
mod protocol;
mod ring_buffer;
mod timer_wheel;
mod types;
mod wrapping_number;

pub use actor_route::{rewrite_for_forward, route_actor, ActorRoute, AddressResolver, LocalActors};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use codec::{decode_message, encode_message, CodecError, MessageCodec};
pub use config::{ConfigError, FiberConfig, ReliableConfig, SessionConfig, TransportConfig};
pub use envelope::{Envelope, EnvelopeError};
pub use error_code::ErrorCode;
pub use frame::{
    encode_frame, peek_opcode, write_frame, FrameError, FrameParser, LENGTH_PREFIX_SIZE,
    OPCODE_SIZE,
};
pub use id_generator::{IdGenerator, SequentialIdGenerator};
pub use message::{MessageClass, NetMessage, NetRequest};
pub use message_kinds::{MessageKind, MessageKinds};
pub use protocol::{check_unique_opcodes, Protocol, ProtocolError, ProtocolPlugin};
pub use ring_buffer::{RingBuffer, RingBufferError, DEFAULT_CHUNK_SIZE};
pub use timer_wheel::{FiredTimer, TimerError, TimerWait, TimerWheel, WaitOutcome};
pub use types::{
    ActorId, ChannelId, ChannelKind, Millis, Opcode, ProcessId, RpcId, SessionId, TimerId,
    TransportKind,
};
pub use wrapping_number::{sequence_greater_than, sequence_less_than, wrapping_diff};
