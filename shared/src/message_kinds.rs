use std::{any::Any, collections::HashMap, fmt};

use crate::{
    codec::{erased_decode, erased_encode, CodecError, MessageCodec},
    message::{MessageClass, NetMessage},
    types::Opcode,
};

type EncodeFn = fn(&dyn Any) -> Result<Vec<u8>, CodecError>;
type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>, CodecError>;

/// Everything the runtime knows about one registered opcode
#[derive(Clone)]
pub struct MessageKind {
    pub opcode: Opcode,
    pub class: MessageClass,
    pub name: &'static str,
    /// For request kinds, the opcode used to answer them
    pub response_opcode: Option<Opcode>,
    codec: Option<(EncodeFn, DecodeFn)>,
}

impl MessageKind {
    pub fn has_codec(&self) -> bool {
        self.codec.is_some()
    }
}

impl fmt::Debug for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageKind")
            .field("opcode", &self.opcode)
            .field("class", &self.class)
            .field("name", &self.name)
            .field("response_opcode", &self.response_opcode)
            .field("has_codec", &self.has_codec())
            .finish()
    }
}

/// Opcode registry: routing class, response pairing and payload codec per opcode
#[derive(Clone, Default)]
pub struct MessageKinds {
    kinds: HashMap<Opcode, MessageKind>,
}

impl MessageKinds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed message. Returns the previously registered kind if the
    /// opcode was already taken, leaving the registry unchanged.
    pub fn add_message<M: NetMessage>(&mut self) -> Result<(), MessageKind> {
        self.insert(MessageKind {
            opcode: M::OPCODE,
            class: M::CLASS,
            name: M::name(),
            response_opcode: None,
            codec: Some((erased_encode::<M>, erased_decode::<M>)),
        })
    }

    /// Registers an opcode whose payload is never decoded on this process
    pub fn add_opaque(
        &mut self,
        opcode: Opcode,
        class: MessageClass,
        name: &'static str,
    ) -> Result<(), MessageKind> {
        self.insert(MessageKind {
            opcode,
            class,
            name,
            response_opcode: None,
            codec: None,
        })
    }

    pub(crate) fn link_response(&mut self, request: Opcode, response: Opcode) {
        if let Some(kind) = self.kinds.get_mut(&request) {
            kind.response_opcode = Some(response);
        }
    }

    fn insert(&mut self, kind: MessageKind) -> Result<(), MessageKind> {
        if let Some(existing) = self.kinds.get(&kind.opcode) {
            return Err(existing.clone());
        }
        self.kinds.insert(kind.opcode, kind);
        Ok(())
    }

    pub fn kind(&self, opcode: Opcode) -> Option<&MessageKind> {
        self.kinds.get(&opcode)
    }

    pub fn class_of(&self, opcode: Opcode) -> Option<MessageClass> {
        self.kinds.get(&opcode).map(|kind| kind.class)
    }

    pub fn response_opcode(&self, request: Opcode) -> Option<Opcode> {
        self.kinds.get(&request).and_then(|kind| kind.response_opcode)
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.kinds.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn opcodes(&self) -> impl Iterator<Item = Opcode> + '_ {
        self.kinds.keys().copied()
    }

    fn codec_of(&self, opcode: Opcode) -> Result<(EncodeFn, DecodeFn), CodecError> {
        let kind = self
            .kinds
            .get(&opcode)
            .ok_or(CodecError::UnknownOpcode { opcode })?;
        kind.codec.ok_or(CodecError::NoCodec {
            opcode,
            name: kind.name,
        })
    }
}

impl MessageCodec for MessageKinds {
    fn encode(&self, opcode: Opcode, message: &dyn Any) -> Result<Vec<u8>, CodecError> {
        let (encode, _) = self.codec_of(opcode)?;
        encode(message)
    }

    fn decode(&self, opcode: Opcode, bytes: &[u8]) -> Result<Box<dyn Any + Send>, CodecError> {
        let (_, decode) = self.codec_of(opcode)?;
        decode(bytes)
    }
}
