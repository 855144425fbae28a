use serde::{de::DeserializeOwned, Serialize};

use crate::types::Opcode;

/// Routing class of an opcode, fixed when the opcode is registered
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// One-way message handled on the receiving process
    Plain,
    /// Expects exactly one `Response` carrying the same rpc id
    Request,
    /// Answer to a `Request`
    Response,
    /// One-way message addressed to an entity, possibly on another process
    ActorMessage,
    /// Request addressed to an entity, answered by an `ActorResponse`
    ActorRequest,
    /// Answer to an `ActorRequest`
    ActorResponse,
}

impl MessageClass {
    /// Whether frames of this class carry an `ActorId` after the opcode
    pub fn is_actor(self) -> bool {
        matches!(
            self,
            MessageClass::ActorMessage | MessageClass::ActorRequest | MessageClass::ActorResponse
        )
    }

    pub fn is_request(self) -> bool {
        matches!(self, MessageClass::Request | MessageClass::ActorRequest)
    }

    pub fn is_response(self) -> bool {
        matches!(self, MessageClass::Response | MessageClass::ActorResponse)
    }

    /// Whether frames of this class carry an rpc id
    pub fn has_rpc_id(self) -> bool {
        self.is_request() || self.is_response()
    }

    /// Class of the reply expected for a request class
    pub fn response_class(self) -> Option<MessageClass> {
        match self {
            MessageClass::Request => Some(MessageClass::Response),
            MessageClass::ActorRequest => Some(MessageClass::ActorResponse),
            _ => None,
        }
    }
}

/// A payload type bound to one opcode and routing class
pub trait NetMessage: Serialize + DeserializeOwned + Send + 'static {
    const OPCODE: Opcode;
    const CLASS: MessageClass;

    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A request payload and the payload type that answers it
pub trait NetRequest: NetMessage {
    type Response: NetMessage;
}

/// Declares a [`NetMessage`] impl.
///
/// ```
/// use actornet_shared::{net_message, MessageClass};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping { seq: u32 }
///
/// net_message!(Ping, 7, MessageClass::Plain);
/// ```
#[macro_export]
macro_rules! net_message {
    ($ty:ty, $opcode:expr, $class:expr) => {
        impl $crate::NetMessage for $ty {
            const OPCODE: $crate::Opcode = $opcode;
            const CLASS: $crate::MessageClass = $class;
        }
    };
}

/// Declares a [`NetRequest`] pairing, registering both sides as messages
#[macro_export]
macro_rules! net_request {
    ($req:ty, $req_opcode:expr, $resp:ty, $resp_opcode:expr) => {
        $crate::net_message!($req, $req_opcode, $crate::MessageClass::Request);
        $crate::net_message!($resp, $resp_opcode, $crate::MessageClass::Response);
        impl $crate::NetRequest for $req {
            type Response = $resp;
        }
    };
    (actor $req:ty, $req_opcode:expr, $resp:ty, $resp_opcode:expr) => {
        $crate::net_message!($req, $req_opcode, $crate::MessageClass::ActorRequest);
        $crate::net_message!($resp, $resp_opcode, $crate::MessageClass::ActorResponse);
        impl $crate::NetRequest for $req {
            type Response = $resp;
        }
    };
}
