//! Messages shared by the integration scenarios

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use actornet_shared::{net_message, net_request, MessageClass, MessageKinds, Protocol};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub value: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub value: u32,
}

net_request!(Ping, 10, Pong, 11);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub text: String,
}

net_message!(Note, 12, MessageClass::Plain);

/// Request whose handler always fails
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Explode {
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Exploded;

net_request!(Explode, 13, Exploded, 14);

/// Request with no handler on either side
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unhandled;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnhandledReply;

net_request!(Unhandled, 15, UnhandledReply, 16);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Move {
    pub x: i32,
    pub y: i32,
}

net_message!(Move, 20, MessageClass::ActorMessage);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetPosition;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

net_request!(actor GetPosition, 21, Position, 22);

/// Opcode no process registers
pub const UNKNOWN_OPCODE: u16 = 999;

pub fn protocol() -> Arc<MessageKinds> {
    let mut protocol = Protocol::builder();
    protocol
        .add_request::<Ping>()
        .add_message::<Note>()
        .add_request::<Explode>()
        .add_request::<Unhandled>()
        .add_message::<Move>()
        .add_request::<GetPosition>();
    protocol.build()
}
