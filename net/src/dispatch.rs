use std::{
    any::Any,
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use log::{error, warn};
use thiserror::Error;

use actornet_shared::{
    check_unique_opcodes, ActorId, CodecError, Envelope, EnvelopeError, ErrorCode, MessageClass,
    MessageKinds, Millis, NetMessage, NetRequest, Opcode, ProtocolError, SessionId,
};

/// Configuration errors found while building handler tables. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Two handlers claim one opcode
    #[error("Handler table rejected: {0}")]
    Duplicate(#[from] ProtocolError),

    #[error("Handler `{name}` is registered for opcode {opcode}, which the protocol does not know")]
    UnregisteredOpcode { opcode: Opcode, name: &'static str },

    #[error("Handler `{name}` for opcode {opcode} of class {class:?} cannot go into the {table} table")]
    ClassMismatch {
        opcode: Opcode,
        name: &'static str,
        class: MessageClass,
        table: &'static str,
    },
}

/// Why a handler did not produce a result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{message}")]
    Failed { code: ErrorCode, message: String },

    #[error("No handler registered for opcode {opcode}")]
    NotFound { opcode: Opcode },

    #[error("Handler for opcode {opcode} panicked: {message}")]
    Panicked { opcode: Opcode, message: String },

    #[error("Handler for request opcode {opcode} returned no response")]
    NoResponse { opcode: Opcode },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl HandlerError {
    /// Application failure with the generic `RPC_FAIL` code
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::RPC_FAIL, message)
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        HandlerError::Failed {
            code,
            message: message.into(),
        }
    }

    /// Code carried by the error response sent back for a failed request
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HandlerError::Failed { code, .. } => *code,
            HandlerError::NotFound { .. } => ErrorCode::HANDLER_NOT_FOUND,
            _ => ErrorCode::RPC_FAIL,
        }
    }
}

pub type HandlerResult = Result<Option<Envelope>, HandlerError>;

/// Something the fiber sends on a handler's behalf once it returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Session {
        session_id: SessionId,
        envelope: Envelope,
    },
    /// Routed like an inbound actor message: local mailbox or forwarded
    Actor { envelope: Envelope },
}

/// What a handler sees besides the envelope
pub struct HandlerContext {
    now: Millis,
    session_id: Option<SessionId>,
    actor_id: Option<ActorId>,
    outbox: Vec<Outgoing>,
}

impl HandlerContext {
    pub fn new(now: Millis, session_id: Option<SessionId>, actor_id: Option<ActorId>) -> Self {
        Self {
            now,
            session_id,
            actor_id,
            outbox: Vec::new(),
        }
    }

    pub fn now(&self) -> Millis {
        self.now
    }

    /// Session the message arrived on; `None` for local mailbox deliveries
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Actor whose mailbox is being processed
    pub fn actor_id(&self) -> Option<ActorId> {
        self.actor_id
    }

    pub fn send(&mut self, session_id: SessionId, envelope: Envelope) {
        self.outbox.push(Outgoing::Session {
            session_id,
            envelope,
        });
    }

    pub fn send_message<M: NetMessage>(
        &mut self,
        session_id: SessionId,
        message: &M,
    ) -> Result<(), CodecError> {
        let envelope = Envelope::from_message(message)?;
        self.send(session_id, envelope);
        Ok(())
    }

    /// Sends an actor message to `actor_id`, wherever it is hosted
    pub fn send_actor_message<M: NetMessage>(
        &mut self,
        actor_id: ActorId,
        message: &M,
    ) -> Result<(), CodecError> {
        let envelope = Envelope::from_message(message)?.with_actor(actor_id);
        self.outbox.push(Outgoing::Actor { envelope });
        Ok(())
    }

    pub fn outbox(&self) -> &[Outgoing] {
        &self.outbox
    }

    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }
}

/// Handles every inbound envelope of one opcode.
///
/// Request handlers return the response envelope; the table stamps the rpc id
/// and actor id. Message handlers return `Ok(None)`.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, context: &mut HandlerContext, envelope: &Envelope) -> HandlerResult;
}

impl<F> MessageHandler for F
where
    F: Fn(&mut HandlerContext, &Envelope) -> HandlerResult + Send + Sync,
{
    fn handle(&self, context: &mut HandlerContext, envelope: &Envelope) -> HandlerResult {
        self(context, envelope)
    }
}

/// Pins a closure to the handler signature
pub fn handler_fn<F>(handler: F) -> F
where
    F: Fn(&mut HandlerContext, &Envelope) -> HandlerResult + Send + Sync + 'static,
{
    handler
}

/// One entry of the explicit registration list a table is built from
#[derive(Clone)]
pub struct HandlerRegistration {
    pub opcode: Opcode,
    pub name: &'static str,
    pub handler: Arc<dyn MessageHandler>,
}

impl HandlerRegistration {
    pub fn new<H: MessageHandler + 'static>(opcode: Opcode, name: &'static str, handler: H) -> Self {
        Self {
            opcode,
            name,
            handler: Arc::new(handler),
        }
    }
}

/// Handler for a plain message `M`
pub fn message_handler<M, F>(handler: F) -> HandlerRegistration
where
    M: NetMessage,
    F: Fn(&mut HandlerContext, M) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    HandlerRegistration::new(
        M::OPCODE,
        M::name(),
        handler_fn(move |context, envelope| {
            handler(context, envelope.decode::<M>()?)?;
            Ok(None)
        }),
    )
}

/// Handler answering request `Q` with `Q::Response`
pub fn request_handler<Q, F>(handler: F) -> HandlerRegistration
where
    Q: NetRequest,
    F: Fn(&mut HandlerContext, Q) -> Result<Q::Response, HandlerError> + Send + Sync + 'static,
{
    HandlerRegistration::new(
        Q::OPCODE,
        Q::name(),
        handler_fn(move |context, envelope| {
            let response = handler(context, envelope.decode::<Q>()?)?;
            Ok(Some(Envelope::from_message(&response)?))
        }),
    )
}

/// Mailbox handler for actor message `M`
pub fn actor_message_handler<M, F>(handler: F) -> HandlerRegistration
where
    M: NetMessage,
    F: Fn(&mut HandlerContext, ActorId, M) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    HandlerRegistration::new(
        M::OPCODE,
        M::name(),
        handler_fn(move |context, envelope| {
            let actor_id = target_actor(envelope)?;
            handler(context, actor_id, envelope.decode::<M>()?)?;
            Ok(None)
        }),
    )
}

/// Mailbox handler answering actor request `Q`
pub fn actor_request_handler<Q, F>(handler: F) -> HandlerRegistration
where
    Q: NetRequest,
    F: Fn(&mut HandlerContext, ActorId, Q) -> Result<Q::Response, HandlerError>
        + Send
        + Sync
        + 'static,
{
    HandlerRegistration::new(
        Q::OPCODE,
        Q::name(),
        handler_fn(move |context, envelope| {
            let actor_id = target_actor(envelope)?;
            let response = handler(context, actor_id, envelope.decode::<Q>()?)?;
            Ok(Some(Envelope::from_message(&response)?))
        }),
    )
}

fn target_actor(envelope: &Envelope) -> Result<ActorId, EnvelopeError> {
    envelope.actor_id.ok_or(EnvelopeError::MissingActorId {
        opcode: envelope.opcode,
        class: envelope.class,
    })
}

/// Opcode to handler routing, built once from an explicit list
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<Opcode, HandlerRegistration>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table, failing on the first opcode registered twice
    pub fn build<I>(registrations: I) -> Result<Self, DispatchError>
    where
        I: IntoIterator<Item = HandlerRegistration>,
    {
        let registrations: Vec<HandlerRegistration> = registrations.into_iter().collect();
        check_unique_opcodes(
            registrations
                .iter()
                .map(|registration| (registration.opcode, registration.name.to_string())),
        )?;

        let mut table = Self::new();
        for registration in registrations {
            table.handlers.insert(registration.opcode, registration);
        }
        Ok(table)
    }

    pub fn try_add(&mut self, registration: HandlerRegistration) -> Result<(), DispatchError> {
        if let Some(existing) = self.handlers.get(&registration.opcode) {
            return Err(DispatchError::Duplicate(ProtocolError::DuplicateOpcode {
                opcode: registration.opcode,
                existing: existing.name.to_string(),
                duplicate: registration.name.to_string(),
            }));
        }
        self.handlers.insert(registration.opcode, registration);
        Ok(())
    }

    /// Checks every handler's opcode is registered with a class `allowed`
    /// accepts. `table` names the table in the error.
    pub fn validate(
        &self,
        kinds: &MessageKinds,
        table: &'static str,
        allowed: fn(MessageClass) -> bool,
    ) -> Result<(), DispatchError> {
        for registration in self.handlers.values() {
            let Some(class) = kinds.class_of(registration.opcode) else {
                return Err(DispatchError::UnregisteredOpcode {
                    opcode: registration.opcode,
                    name: registration.name,
                });
            };
            if !allowed(class) {
                return Err(DispatchError::ClassMismatch {
                    opcode: registration.opcode,
                    name: registration.name,
                    class,
                    table,
                });
            }
        }
        Ok(())
    }

    pub fn contains(&self, opcode: Opcode) -> bool {
        self.handlers.contains_key(&opcode)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler for `envelope.opcode`. Panics are caught and returned
    /// as `HandlerError::Panicked`.
    pub fn invoke(&self, context: &mut HandlerContext, envelope: &Envelope) -> HandlerResult {
        let Some(registration) = self.handlers.get(&envelope.opcode) else {
            return Err(HandlerError::NotFound {
                opcode: envelope.opcode,
            });
        };
        match catch_unwind(AssertUnwindSafe(|| {
            registration.handler.handle(context, envelope)
        })) {
            Ok(result) => result,
            Err(payload) => Err(HandlerError::Panicked {
                opcode: envelope.opcode,
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Turns a handler outcome into the envelope to send back, if any.
///
/// Requests always get a reply: the handler's response stamped with the
/// request's rpc id (and actor id for actor requests), or an error response on
/// the request's linked response opcode. Failed plain messages are logged.
pub fn reply_for(request: &Envelope, kinds: &MessageKinds, outcome: HandlerResult) -> Option<Envelope> {
    let Some(response_class) = request.class.response_class() else {
        match outcome {
            Ok(Some(envelope)) => warn!(
                "handler for message opcode {} returned opcode {}, ignored",
                request.opcode, envelope.opcode
            ),
            Ok(None) => {}
            Err(err) => error!("handler for opcode {} failed: {}", request.opcode, err),
        }
        return None;
    };

    let outcome = match outcome {
        Ok(Some(response)) if response.class == response_class => Ok(response),
        Ok(Some(response)) => Err(HandlerError::new(format!(
            "handler for opcode {} answered with opcode {} of class {:?}",
            request.opcode, response.opcode, response.class
        ))),
        Ok(None) => Err(HandlerError::NoResponse {
            opcode: request.opcode,
        }),
        Err(err) => Err(err),
    };

    let mut reply = match outcome {
        Ok(response) => response.with_rpc_id(request.rpc_id),
        Err(err) => {
            error!(
                "request opcode {} rpc {} failed: {}",
                request.opcode, request.rpc_id, err
            );
            let Some(response_opcode) = kinds.response_opcode(request.opcode) else {
                error!(
                    "request opcode {} has no linked response opcode, caller is not answered",
                    request.opcode
                );
                return None;
            };
            Envelope::error_response(
                response_opcode,
                response_class,
                request.rpc_id,
                err.error_code(),
                err.to_string(),
            )
        }
    };
    if let Some(actor_id) = request.actor_id {
        reply.actor_id = Some(actor_id);
    }
    Some(reply)
}
