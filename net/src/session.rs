use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use log::{debug, warn};
use thiserror::Error;
use tokio::sync::oneshot;

use actornet_shared::{
    ActorId, ChannelId, ChannelKind, CodecError, Envelope, EnvelopeError, ErrorCode, MessageClass,
    MessageKinds, Millis, NetMessage, NetRequest, Opcode, RpcId, SessionId,
};

use crate::{channel::ChannelError, service::Service};

/// Why a call did not produce a reply
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The session went away before the reply arrived
    #[error("Session {session_id} closed with error {error} before the reply arrived")]
    Disconnected {
        session_id: SessionId,
        error: ErrorCode,
    },

    /// The remote handler answered with an error response
    #[error("Remote call failed with error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// The reply arrived but its body could not be decoded
    #[error("Reply could not be decoded: {0}")]
    Decode(EnvelopeError),
}

/// Errors returned synchronously by session operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Session {session_id} is closed")]
    Closed { session_id: SessionId },

    #[error("Opcode {opcode} has class {class:?} and cannot be used as a call")]
    NotARequest { opcode: Opcode, class: MessageClass },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Where a session writes its frames
pub trait FrameSink {
    fn send_frame(&mut self, channel_id: ChannelId, frame: &[u8]) -> Result<(), ChannelError>;
}

impl<S: Service + ?Sized> FrameSink for S {
    fn send_frame(&mut self, channel_id: ChannelId, frame: &[u8]) -> Result<(), ChannelError> {
        self.send(channel_id, frame)
    }
}

/// Completion handle of one call, resolved exactly once
pub struct ResponseFuture {
    session_id: SessionId,
    rpc_id: RpcId,
    receiver: oneshot::Receiver<Result<Envelope, RpcError>>,
}

impl ResponseFuture {
    pub fn rpc_id(&self) -> RpcId {
        self.rpc_id
    }

    /// Non-blocking check; `None` while the call is still pending
    pub fn try_take(&mut self) -> Option<Result<Envelope, RpcError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(self.dropped())),
        }
    }

    fn dropped(&self) -> RpcError {
        RpcError::Disconnected {
            session_id: self.session_id,
            error: ErrorCode::SESSION_DISPOSED,
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Envelope, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(self.dropped())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// [`ResponseFuture`] that decodes the reply as `R`
pub struct TypedResponse<R> {
    inner: ResponseFuture,
    phantom: PhantomData<fn() -> R>,
}

impl<R: NetMessage> TypedResponse<R> {
    pub fn rpc_id(&self) -> RpcId {
        self.inner.rpc_id
    }

    pub fn try_take(&mut self) -> Option<Result<R, RpcError>> {
        self.inner.try_take().map(decode_reply)
    }
}

impl<R: NetMessage> Future for TypedResponse<R> {
    type Output = Result<R, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(decode_reply)
    }
}

fn decode_reply<R: NetMessage>(result: Result<Envelope, RpcError>) -> Result<R, RpcError> {
    result.and_then(|envelope| envelope.decode::<R>().map_err(RpcError::Decode))
}

/// What the owner has to do with an inbound frame
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// A pending call was resolved
    Resolved(RpcId),
    /// Frame was malformed, or a reply nobody waits for; already logged
    Dropped,
    /// Needs a handler, a mailbox or a relay
    Dispatch(Envelope),
}

/// A peer reached over one channel, with call/reply correlation.
pub struct Session {
    id: SessionId,
    service: usize,
    kind: ChannelKind,
    remote: SocketAddr,
    kinds: Arc<MessageKinds>,
    last_send: Millis,
    last_recv: Millis,
    next_rpc_id: RpcId,
    pending: HashMap<RpcId, oneshot::Sender<Result<Envelope, RpcError>>>,
    error: ErrorCode,
    disposed: bool,
}

impl Session {
    /// `id` is the id of the wrapped channel; `service` indexes the owner's services
    pub fn new(
        id: ChannelId,
        service: usize,
        kind: ChannelKind,
        remote: SocketAddr,
        kinds: Arc<MessageKinds>,
        now: Millis,
    ) -> Self {
        Self {
            id,
            service,
            kind,
            remote,
            kinds,
            last_send: now,
            last_recv: now,
            next_rpc_id: 1,
            pending: HashMap::new(),
            error: ErrorCode::NONE,
            disposed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn service(&self) -> usize {
        self.service
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn last_send(&self) -> Millis {
        self.last_send
    }

    pub fn last_recv(&self) -> Millis {
        self.last_recv
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Error the session was disposed with
    pub fn error(&self) -> ErrorCode {
        self.error
    }

    /// Writes one envelope to the channel
    pub fn send<K: FrameSink + ?Sized>(
        &mut self,
        sink: &mut K,
        envelope: &Envelope,
        now: Millis,
    ) -> Result<(), SessionError> {
        if self.disposed {
            return Err(SessionError::Closed {
                session_id: self.id,
            });
        }
        let bytes = envelope.to_bytes()?;
        sink.send_frame(self.id, &bytes)?;
        self.last_send = now;
        Ok(())
    }

    pub fn send_message<M: NetMessage, K: FrameSink + ?Sized>(
        &mut self,
        sink: &mut K,
        message: &M,
        now: Millis,
    ) -> Result<(), SessionError> {
        let envelope = Envelope::from_message(message)?;
        self.send(sink, &envelope, now)
    }

    pub fn send_actor_message<M: NetMessage, K: FrameSink + ?Sized>(
        &mut self,
        sink: &mut K,
        actor_id: ActorId,
        message: &M,
        now: Millis,
    ) -> Result<(), SessionError> {
        let envelope = Envelope::from_message(message)?.with_actor(actor_id);
        self.send(sink, &envelope, now)
    }

    /// Sends a request envelope under a fresh rpc id and returns the handle
    /// its reply will resolve
    pub fn call<K: FrameSink + ?Sized>(
        &mut self,
        sink: &mut K,
        envelope: Envelope,
        now: Millis,
    ) -> Result<ResponseFuture, SessionError> {
        if !envelope.class.is_request() {
            return Err(SessionError::NotARequest {
                opcode: envelope.opcode,
                class: envelope.class,
            });
        }
        let rpc_id = self.reserve_rpc_id();
        let envelope = envelope.with_rpc_id(rpc_id);
        self.send(sink, &envelope, now)?;

        let (sender, receiver) = oneshot::channel();
        self.pending.insert(rpc_id, sender);
        Ok(ResponseFuture {
            session_id: self.id,
            rpc_id,
            receiver,
        })
    }

    pub fn call_request<Q: NetRequest, K: FrameSink + ?Sized>(
        &mut self,
        sink: &mut K,
        request: &Q,
        now: Millis,
    ) -> Result<TypedResponse<Q::Response>, SessionError> {
        let envelope = Envelope::from_message(request)?;
        Ok(TypedResponse {
            inner: self.call(sink, envelope, now)?,
            phantom: PhantomData,
        })
    }

    pub fn call_actor<Q: NetRequest, K: FrameSink + ?Sized>(
        &mut self,
        sink: &mut K,
        actor_id: ActorId,
        request: &Q,
        now: Millis,
    ) -> Result<TypedResponse<Q::Response>, SessionError> {
        let envelope = Envelope::from_message(request)?.with_actor(actor_id);
        Ok(TypedResponse {
            inner: self.call(sink, envelope, now)?,
            phantom: PhantomData,
        })
    }

    /// Next rpc id: starts at 1, wraps past `u32::MAX`, never 0 and never one
    /// still pending
    pub fn reserve_rpc_id(&mut self) -> RpcId {
        loop {
            let rpc_id = self.next_rpc_id;
            self.next_rpc_id = self.next_rpc_id.wrapping_add(1);
            if self.next_rpc_id == 0 {
                self.next_rpc_id = 1;
            }
            if !self.pending.contains_key(&rpc_id) {
                return rpc_id;
            }
        }
    }

    /// Decodes an inbound frame and resolves replies addressed to this session
    pub fn on_frame(&mut self, frame: &[u8], now: Millis) -> Inbound {
        if self.disposed {
            return Inbound::Dropped;
        }
        self.last_recv = now;
        let envelope = match Envelope::from_bytes(frame, &self.kinds) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("session {} dropped a frame: {}", self.id, err);
                return Inbound::Dropped;
            }
        };
        match envelope.class {
            MessageClass::Response => {
                let rpc_id = envelope.rpc_id;
                if self.resolve(envelope) {
                    Inbound::Resolved(rpc_id)
                } else {
                    Inbound::Dropped
                }
            }
            // not ours: may be a relayed reply
            MessageClass::ActorResponse if !self.pending.contains_key(&envelope.rpc_id) => {
                Inbound::Dispatch(envelope)
            }
            MessageClass::ActorResponse => {
                let rpc_id = envelope.rpc_id;
                self.resolve(envelope);
                Inbound::Resolved(rpc_id)
            }
            _ => Inbound::Dispatch(envelope),
        }
    }

    /// Resolves the call waiting on `envelope.rpc_id`. Late, duplicate and
    /// unknown replies are dropped.
    pub fn resolve(&mut self, envelope: Envelope) -> bool {
        let Some(sender) = self.pending.remove(&envelope.rpc_id) else {
            warn!(
                "session {} dropped reply opcode {} for unknown rpc id {} ({})",
                self.id, envelope.opcode, envelope.rpc_id, envelope.error
            );
            return false;
        };
        let result = if envelope.is_error() {
            Err(RpcError::Remote {
                code: envelope.error,
                message: envelope.error_message,
            })
        } else {
            Ok(envelope)
        };
        // caller may have stopped waiting
        let _ = sender.send(result);
        true
    }

    /// Fails every pending call with `error`. Returns false if already disposed.
    pub fn dispose(&mut self, error: ErrorCode) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        self.error = error;
        let failed = self.pending.len();
        for (_, sender) in self.pending.drain() {
            let _ = sender.send(Err(RpcError::Disconnected {
                session_id: self.id,
                error,
            }));
        }
        debug!(
            "session {} to {} disposed with {}, {} pending calls failed",
            self.id, self.remote, error, failed
        );
        true
    }

    /// Whether both directions have been silent for longer than `timeout`
    pub fn is_idle(&self, now: Millis, timeout: Millis) -> bool {
        now.saturating_sub(self.last_send) > timeout && now.saturating_sub(self.last_recv) > timeout
    }
}
