use std::{collections::HashMap, sync::Arc};

use crate::{
    message::{MessageClass, NetMessage, NetRequest},
    message_kinds::MessageKinds,
    types::Opcode,
};

pub mod error;
pub use error::ProtocolError;

// Protocol Plugin
pub trait ProtocolPlugin {
    fn build(&self, protocol: &mut Protocol);
}

/// Opcode registry shared by every process that talks to each other.
///
/// Built once at startup, then locked. Registering an opcode twice is a
/// configuration error.
#[derive(Default)]
pub struct Protocol {
    pub message_kinds: MessageKinds,
    locked: bool,
}

impl Protocol {
    pub fn builder() -> Self {
        Self::default()
    }

    pub fn add_plugin<P: ProtocolPlugin>(&mut self, plugin: P) -> &mut Self {
        self.check_lock();
        plugin.build(self);
        self
    }

    pub fn add_message<M: NetMessage>(&mut self) -> &mut Self {
        if let Err(err) = self.try_add_message::<M>() {
            panic!("{}", err);
        }
        self
    }

    pub fn add_request<Q: NetRequest>(&mut self) -> &mut Self {
        if let Err(err) = self.try_add_request::<Q>() {
            panic!("{}", err);
        }
        self
    }

    /// Registers an opcode this process routes but never decodes
    pub fn add_opaque(&mut self, opcode: Opcode, class: MessageClass, name: &'static str) -> &mut Self {
        if let Err(err) = self.try_add_opaque(opcode, class, name) {
            panic!("{}", err);
        }
        self
    }

    /// Registers an opaque request/response pair
    pub fn add_opaque_request(
        &mut self,
        request: (Opcode, &'static str),
        response: (Opcode, &'static str),
        class: MessageClass,
    ) -> &mut Self {
        if let Err(err) = self.try_add_opaque_request(request, response, class) {
            panic!("{}", err);
        }
        self
    }

    // Non-panicking builder methods

    pub fn try_add_plugin<P: ProtocolPlugin>(&mut self, plugin: P) -> Result<&mut Self, ProtocolError> {
        self.try_check_lock()?;
        plugin.build(self);
        Ok(self)
    }

    pub fn try_add_message<M: NetMessage>(&mut self) -> Result<&mut Self, ProtocolError> {
        self.try_check_lock()?;
        self.message_kinds
            .add_message::<M>()
            .map_err(|existing| duplicate(M::OPCODE, existing.name, M::name()))?;
        Ok(self)
    }

    pub fn try_add_request<Q: NetRequest>(&mut self) -> Result<&mut Self, ProtocolError> {
        self.try_check_lock()?;
        let response_class = check_request_class(Q::OPCODE, Q::name(), Q::CLASS)?;
        check_class(
            Q::Response::OPCODE,
            Q::Response::name(),
            response_class,
            Q::Response::CLASS,
        )?;
        check_unique_opcodes([
            (Q::OPCODE, Q::name().to_string()),
            (Q::Response::OPCODE, Q::Response::name().to_string()),
        ])?;
        self.try_check_free(Q::OPCODE, Q::name())?;
        self.try_check_free(Q::Response::OPCODE, Q::Response::name())?;

        self.message_kinds
            .add_message::<Q>()
            .map_err(|existing| duplicate(Q::OPCODE, existing.name, Q::name()))?;
        self.message_kinds
            .add_message::<Q::Response>()
            .map_err(|existing| duplicate(Q::Response::OPCODE, existing.name, Q::Response::name()))?;
        self.message_kinds
            .link_response(Q::OPCODE, Q::Response::OPCODE);
        Ok(self)
    }

    pub fn try_add_opaque(
        &mut self,
        opcode: Opcode,
        class: MessageClass,
        name: &'static str,
    ) -> Result<&mut Self, ProtocolError> {
        self.try_check_lock()?;
        self.message_kinds
            .add_opaque(opcode, class, name)
            .map_err(|existing| duplicate(opcode, existing.name, name))?;
        Ok(self)
    }

    pub fn try_add_opaque_request(
        &mut self,
        request: (Opcode, &'static str),
        response: (Opcode, &'static str),
        class: MessageClass,
    ) -> Result<&mut Self, ProtocolError> {
        self.try_check_lock()?;
        let response_class = check_request_class(request.0, request.1, class)?;
        check_unique_opcodes([
            (request.0, request.1.to_string()),
            (response.0, response.1.to_string()),
        ])?;
        self.try_check_free(request.0, request.1)?;
        self.try_check_free(response.0, response.1)?;

        self.try_add_opaque(request.0, class, request.1)?;
        self.try_add_opaque(response.0, response_class, response.1)?;
        self.message_kinds.link_response(request.0, response.0);
        Ok(self)
    }

    pub fn try_lock(&mut self) -> Result<(), ProtocolError> {
        self.try_check_lock()?;
        self.locked = true;
        Ok(())
    }

    pub fn lock(&mut self) {
        self.check_lock();
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Checks if protocol is locked without panicking
    /// Returns Err if protocol is locked
    pub fn try_check_lock(&self) -> Result<(), ProtocolError> {
        if self.locked {
            Err(ProtocolError::AlreadyLocked)
        } else {
            Ok(())
        }
    }

    /// Checks if protocol is locked, panics if it is
    pub fn check_lock(&self) {
        if self.locked {
            panic!("Protocol already locked!");
        }
    }

    /// Locks the protocol and hands out a shareable registry
    pub fn build(&mut self) -> Arc<MessageKinds> {
        self.locked = true;
        Arc::new(std::mem::take(&mut self.message_kinds))
    }

    fn try_check_free(&self, opcode: Opcode, name: &'static str) -> Result<(), ProtocolError> {
        match self.message_kinds.kind(opcode) {
            Some(existing) => Err(duplicate(opcode, existing.name, name)),
            None => Ok(()),
        }
    }
}

/// Fails on the first opcode that appears twice in `registrations`
pub fn check_unique_opcodes<I>(registrations: I) -> Result<(), ProtocolError>
where
    I: IntoIterator<Item = (Opcode, String)>,
{
    let mut seen: HashMap<Opcode, String> = HashMap::new();
    for (opcode, name) in registrations {
        if let Some(existing) = seen.get(&opcode) {
            return Err(ProtocolError::DuplicateOpcode {
                opcode,
                existing: existing.clone(),
                duplicate: name,
            });
        }
        seen.insert(opcode, name);
    }
    Ok(())
}

fn duplicate(opcode: Opcode, existing: &str, duplicate: &str) -> ProtocolError {
    ProtocolError::DuplicateOpcode {
        opcode,
        existing: existing.to_string(),
        duplicate: duplicate.to_string(),
    }
}

fn check_request_class(
    opcode: Opcode,
    name: &'static str,
    class: MessageClass,
) -> Result<MessageClass, ProtocolError> {
    class.response_class().ok_or(ProtocolError::ClassMismatch {
        opcode,
        name,
        expected: MessageClass::Request,
        actual: class,
    })
}

fn check_class(
    opcode: Opcode,
    name: &'static str,
    expected: MessageClass,
    actual: MessageClass,
) -> Result<(), ProtocolError> {
    if expected != actual {
        return Err(ProtocolError::ClassMismatch {
            opcode,
            name,
            expected,
            actual,
        });
    }
    Ok(())
}
