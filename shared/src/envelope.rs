use thiserror::Error;

use crate::{
    codec::{decode_message, encode_message, CodecError},
    error_code::ErrorCode,
    frame::{peek_opcode, OPCODE_SIZE},
    message::{MessageClass, NetMessage},
    message_kinds::MessageKinds,
    types::{ActorId, Opcode, RpcId},
};

/// Errors raised while reading or writing an [`Envelope`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("Frame of {length} bytes is too short to hold a 2-byte opcode")]
    NoOpcode { length: usize },

    #[error("Opcode {opcode} is not registered with the protocol")]
    UnknownOpcode { opcode: Opcode },

    #[error("Frame for opcode {opcode} ends after {available} bytes, header needs {needed}")]
    Truncated {
        opcode: Opcode,
        needed: usize,
        available: usize,
    },

    #[error("Error message in response opcode {opcode} is not valid UTF-8")]
    InvalidErrorMessage { opcode: Opcode },

    #[error("Error message of {length} bytes does not fit the 16-bit length field")]
    ErrorMessageTooLong { length: usize },

    #[error("Opcode {opcode} has class {class:?} and must carry an actor id")]
    MissingActorId { opcode: Opcode, class: MessageClass },

    #[error("Envelope opcode {actual} does not match expected opcode {expected}")]
    OpcodeMismatch { expected: Opcode, actual: Opcode },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// One decoded frame: the routing header plus the still-encoded payload.
///
/// Wire layout, all integers little-endian:
/// `opcode u16 | actor id (actor classes) | rpc id u32 (request and response
/// classes) | error i32, message len u16, message (response classes) | body`.
/// The class is never transmitted; both ends look it up by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub opcode: Opcode,
    pub class: MessageClass,
    pub actor_id: Option<ActorId>,
    pub rpc_id: RpcId,
    pub error: ErrorCode,
    pub error_message: String,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(opcode: Opcode, class: MessageClass, body: Vec<u8>) -> Self {
        Self {
            opcode,
            class,
            actor_id: None,
            rpc_id: 0,
            error: ErrorCode::NONE,
            error_message: String::new(),
            body,
        }
    }

    /// Encodes a typed message into an envelope of its registered class
    pub fn from_message<M: NetMessage>(message: &M) -> Result<Self, CodecError> {
        Ok(Self::new(M::OPCODE, M::CLASS, encode_message(message)?))
    }

    /// Builds the error reply to a request: empty body, non-zero error code
    pub fn error_response(
        opcode: Opcode,
        class: MessageClass,
        rpc_id: RpcId,
        error: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        let mut envelope = Self::new(opcode, class, Vec::new());
        envelope.rpc_id = rpc_id;
        envelope.error = error;
        envelope.error_message = message.into();
        envelope
    }

    pub fn with_actor(mut self, actor_id: ActorId) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_rpc_id(mut self, rpc_id: RpcId) -> Self {
        self.rpc_id = rpc_id;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_error()
    }

    /// Decodes the body as `M`, checking the opcode first
    pub fn decode<M: NetMessage>(&self) -> Result<M, EnvelopeError> {
        if self.opcode != M::OPCODE {
            return Err(EnvelopeError::OpcodeMismatch {
                expected: M::OPCODE,
                actual: self.opcode,
            });
        }
        Ok(decode_message(&self.body)?)
    }

    /// Serializes to frame bytes (without the stream length prefix)
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut bytes = Vec::with_capacity(self.header_len() + self.body.len());
        bytes.extend_from_slice(&self.opcode.to_le_bytes());
        if self.class.is_actor() {
            let actor_id = self.actor_id.ok_or(EnvelopeError::MissingActorId {
                opcode: self.opcode,
                class: self.class,
            })?;
            bytes.extend_from_slice(&actor_id.to_bytes());
        }
        if self.class.has_rpc_id() {
            bytes.extend_from_slice(&self.rpc_id.to_le_bytes());
        }
        if self.class.is_response() {
            let message = self.error_message.as_bytes();
            if message.len() > u16::MAX as usize {
                return Err(EnvelopeError::ErrorMessageTooLong {
                    length: message.len(),
                });
            }
            bytes.extend_from_slice(&self.error.0.to_le_bytes());
            bytes.extend_from_slice(&(message.len() as u16).to_le_bytes());
            bytes.extend_from_slice(message);
        }
        bytes.extend_from_slice(&self.body);
        Ok(bytes)
    }

    /// Parses frame bytes, taking the class from the opcode registry
    pub fn from_bytes(frame: &[u8], kinds: &MessageKinds) -> Result<Self, EnvelopeError> {
        let opcode = peek_opcode(frame).map_err(|_| EnvelopeError::NoOpcode {
            length: frame.len(),
        })?;
        let class = kinds
            .class_of(opcode)
            .ok_or(EnvelopeError::UnknownOpcode { opcode })?;

        let mut reader = HeaderReader {
            opcode,
            frame,
            offset: OPCODE_SIZE,
        };
        let mut envelope = Envelope::new(opcode, class, Vec::new());
        if class.is_actor() {
            envelope.actor_id = Some(ActorId::from_bytes(&reader.take_array()?));
        }
        if class.has_rpc_id() {
            envelope.rpc_id = u32::from_le_bytes(reader.take_array()?);
        }
        if class.is_response() {
            envelope.error = ErrorCode(i32::from_le_bytes(reader.take_array()?));
            let length = u16::from_le_bytes(reader.take_array()?) as usize;
            let message = reader.take(length)?;
            envelope.error_message = std::str::from_utf8(message)
                .map_err(|_| EnvelopeError::InvalidErrorMessage { opcode })?
                .to_string();
        }
        envelope.body = frame[reader.offset..].to_vec();
        Ok(envelope)
    }

    fn header_len(&self) -> usize {
        let mut length = OPCODE_SIZE;
        if self.class.is_actor() {
            length += ActorId::WIRE_SIZE;
        }
        if self.class.has_rpc_id() {
            length += 4;
        }
        if self.class.is_response() {
            length += 6 + self.error_message.len();
        }
        length
    }
}

struct HeaderReader<'a> {
    opcode: Opcode,
    frame: &'a [u8],
    offset: usize,
}

impl<'a> HeaderReader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.offset + count;
        if end > self.frame.len() {
            return Err(EnvelopeError::Truncated {
                opcode: self.opcode,
                needed: end,
                available: self.frame.len(),
            });
        }
        let bytes = &self.frame[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], EnvelopeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
