use std::any::Any;

use thiserror::Error;

use crate::{message::NetMessage, types::Opcode};

/// Errors raised at the codec boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Opcode has no registered message kind
    #[error("Opcode {opcode} is not registered with the protocol")]
    UnknownOpcode { opcode: Opcode },

    /// Opcode is registered without a payload codec (opaque, forward-only kind)
    #[error("Opcode {opcode} ({name}) is registered without a payload codec")]
    NoCodec { opcode: Opcode, name: &'static str },

    /// The value handed to `encode` is not the type registered for the opcode
    #[error("Value passed for opcode {opcode} is not a {expected}")]
    TypeMismatch {
        opcode: Opcode,
        expected: &'static str,
    },

    /// Payload could not be serialized
    #[error("Failed to encode payload for opcode {opcode}: {message}")]
    Encode { opcode: Opcode, message: String },

    /// Payload bytes could not be deserialized
    #[error("Failed to decode payload for opcode {opcode}: {message}")]
    Decode { opcode: Opcode, message: String },
}

/// The injected `Encode(opcode, object)` / `Decode(opcode, bytes)` pair.
///
/// The core never interprets payload bytes itself; it only hands them to this
/// trait keyed by opcode.
pub trait MessageCodec: Send + Sync {
    fn encode(&self, opcode: Opcode, message: &dyn Any) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, opcode: Opcode, bytes: &[u8]) -> Result<Box<dyn Any + Send>, CodecError>;
}

/// Serializes a typed message with bincode
pub fn encode_message<M: NetMessage>(message: &M) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(message).map_err(|err| CodecError::Encode {
        opcode: M::OPCODE,
        message: err.to_string(),
    })
}

/// Deserializes a typed message with bincode
pub fn decode_message<M: NetMessage>(bytes: &[u8]) -> Result<M, CodecError> {
    bincode::deserialize(bytes).map_err(|err| CodecError::Decode {
        opcode: M::OPCODE,
        message: err.to_string(),
    })
}

// Type-erased entry points stored per opcode in `MessageKinds`

pub(crate) fn erased_encode<M: NetMessage>(message: &dyn Any) -> Result<Vec<u8>, CodecError> {
    let message = message
        .downcast_ref::<M>()
        .ok_or(CodecError::TypeMismatch {
            opcode: M::OPCODE,
            expected: M::name(),
        })?;
    encode_message(message)
}

pub(crate) fn erased_decode<M: NetMessage>(
    bytes: &[u8],
) -> Result<Box<dyn Any + Send>, CodecError> {
    let message: M = decode_message(bytes)?;
    Ok(Box::new(message))
}
