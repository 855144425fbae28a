//! # Actornet
//! Channels over stream sockets, reliable UDP or WebSockets, wrapped in
//! sessions that correlate requests with replies, and an opcode dispatcher
//! that delivers actor-addressed messages to local mailboxes or forwards them
//! to the process hosting the actor. Everything for one scheduling context
//! lives in a [`Fiber`].

#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces
)]

#[macro_use]
extern crate cfg_if;

pub mod transport;
pub mod shared {
    pub use actornet_shared::{
        decode_message, encode_message, encode_frame, ActorId, ActorRoute, AddressResolver,
        ChannelId, ChannelKind, Clock, CodecError, Envelope, EnvelopeError, ErrorCode,
        FiberConfig, FrameParser, IdGenerator, LocalActors, ManualClock, MessageClass,
        MessageKinds, Millis, MonotonicClock, NetMessage, NetRequest, Opcode, ProcessId,
        Protocol, ProtocolError, ReliableConfig, RingBuffer, RpcId, SequentialIdGenerator,
        SessionConfig, SessionId, TimerId, TimerWait, TransportConfig, TransportKind,
        WaitOutcome,
    };
}

mod channel;
mod dispatch;
mod fiber;
mod mailbox;
mod service;
mod session;

pub use channel::{check_frame_size, ChannelError, ChannelInfo, ChannelState};
pub use dispatch::{
    actor_message_handler, actor_request_handler, handler_fn, message_handler, reply_for,
    request_handler, DispatchError, HandlerContext, HandlerError, HandlerRegistration,
    HandlerResult, HandlerTable, MessageHandler, Outgoing,
};
pub use fiber::{Fiber, FiberBuilder, FiberError, FiberEvent};
pub use mailbox::{Delivery, Mailboxes};
pub use service::{Service, ServiceEvent};
pub use session::{
    FrameSink, Inbound, ResponseFuture, RpcError, Session, SessionError, TypedResponse,
};
