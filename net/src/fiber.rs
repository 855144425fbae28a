use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use log::{debug, info, warn};
use thiserror::Error;

use actornet_shared::{
    rewrite_for_forward, route_actor, ActorId, ActorRoute, AddressResolver, ChannelKind, Clock,
    CodecError, ConfigError, Envelope, ErrorCode, FiberConfig, IdGenerator, MessageClass,
    MessageKinds, Millis, MonotonicClock, NetMessage, NetRequest, Opcode, ProcessId, RpcId,
    SequentialIdGenerator, SessionId, TimerError, TimerId, TimerWait, TimerWheel,
};

use crate::{
    channel::ChannelError,
    dispatch::{
        reply_for, DispatchError, HandlerContext, HandlerError, HandlerRegistration, HandlerTable,
        Outgoing,
    },
    mailbox::{Delivery, Mailboxes},
    service::{Service, ServiceEvent},
    session::{Inbound, ResponseFuture, Session, SessionError, TypedResponse},
};

/// Errors returned by [`Fiber`] operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FiberError {
    #[error("Invalid fiber configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid handler registration: {0}")]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error("Session {session_id} does not exist")]
    SessionNotFound { session_id: SessionId },

    #[error("Service {service} does not exist")]
    ServiceNotFound { service: usize },

    #[error("No service is configured for forwarding to process {process}")]
    NoForwardService { process: ProcessId },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Something the host of a fiber should know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiberEvent {
    SessionAccepted {
        session_id: SessionId,
        remote: SocketAddr,
    },
    SessionConnected {
        session_id: SessionId,
        remote: SocketAddr,
    },
    /// Session is gone; every call pending on it failed with `error`
    SessionClosed {
        session_id: SessionId,
        error: ErrorCode,
    },
    /// An application timer fired
    Timer { timer_id: TimerId, tag: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FiberTimer {
    IdleCheck,
    AcceptTimeout(SessionId),
    App(u64),
}

// A forwarded actor request waiting for its reply on an inner session
struct Relay {
    origin: SessionId,
    origin_rpc: RpcId,
    opcode: Opcode,
    actor_id: ActorId,
}

/// Builds a [`Fiber`], refusing invalid configuration and duplicate handlers
pub struct FiberBuilder {
    config: FiberConfig,
    kinds: Arc<MessageKinds>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    handlers: Vec<HandlerRegistration>,
    actor_handlers: Vec<HandlerRegistration>,
    resolver: Option<Box<dyn AddressResolver + Send>>,
}

impl FiberBuilder {
    pub fn new(config: FiberConfig, kinds: Arc<MessageKinds>) -> Self {
        Self {
            config,
            kinds,
            clock: None,
            ids: None,
            handlers: Vec::new(),
            actor_handlers: Vec::new(),
            resolver: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Id source shared with this fiber's services
    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Handler for a plain message or request arriving on a session
    pub fn handler(mut self, registration: HandlerRegistration) -> Self {
        self.handlers.push(registration);
        self
    }

    pub fn handlers<I: IntoIterator<Item = HandlerRegistration>>(mut self, registrations: I) -> Self {
        self.handlers.extend(registrations);
        self
    }

    /// Handler run for actor messages taken off local mailboxes
    pub fn actor_handler(mut self, registration: HandlerRegistration) -> Self {
        self.actor_handlers.push(registration);
        self
    }

    pub fn actor_handlers<I: IntoIterator<Item = HandlerRegistration>>(
        mut self,
        registrations: I,
    ) -> Self {
        self.actor_handlers.extend(registrations);
        self
    }

    /// Resolves process ids for actors hosted elsewhere
    pub fn resolver<R: AddressResolver + Send + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    pub fn build(self) -> Result<Fiber, FiberError> {
        self.config.validate()?;

        let handlers = HandlerTable::build(self.handlers)?;
        handlers.validate(&self.kinds, "session", |class| {
            matches!(class, MessageClass::Plain | MessageClass::Request)
        })?;
        let actor_handlers = HandlerTable::build(self.actor_handlers)?;
        actor_handlers.validate(&self.kinds, "actor", |class| {
            matches!(class, MessageClass::ActorMessage | MessageClass::ActorRequest)
        })?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(SequentialIdGenerator::new()));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Box::new(HashMap::<ProcessId, SocketAddr>::new()));

        let mut timers = TimerWheel::with_ids(clock.clone(), ids.clone());
        let idle_check = millis(self.config.session.idle_check_interval);
        let idle_timer = timers.new_repeating_timer(idle_check, FiberTimer::IdleCheck)?;

        info!(
            "fiber for process {} started with {} session handlers and {} actor handlers",
            self.config.process,
            handlers.len(),
            actor_handlers.len()
        );

        Ok(Fiber {
            config: self.config,
            kinds: self.kinds,
            clock,
            ids,
            services: Vec::new(),
            sessions: HashMap::new(),
            timers,
            idle_timer,
            accept_timers: HashMap::new(),
            handlers,
            actor_handlers,
            mailboxes: Mailboxes::new(),
            resolver,
            forward_service: None,
            routes: HashMap::new(),
            relays: HashMap::new(),
            events: VecDeque::new(),
        })
    }
}

fn millis(duration: std::time::Duration) -> Millis {
    duration.as_millis() as Millis
}

/// One single-threaded scheduling context.
///
/// Owns its services, sessions, timer wheel, handler tables and mailboxes.
/// Nothing in here is shared with other fibers; they talk through sessions.
/// The host drives it by calling [`Fiber::update`] and draining
/// [`Fiber::receive`].
pub struct Fiber {
    config: FiberConfig,
    kinds: Arc<MessageKinds>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    services: Vec<Box<dyn Service>>,
    sessions: HashMap<SessionId, Session>,
    timers: TimerWheel<FiberTimer>,
    idle_timer: TimerId,
    accept_timers: HashMap<SessionId, TimerId>,
    handlers: HandlerTable,
    actor_handlers: HandlerTable,
    mailboxes: Mailboxes,
    resolver: Box<dyn AddressResolver + Send>,
    forward_service: Option<usize>,
    // inner sessions used to reach other processes
    routes: HashMap<ProcessId, SessionId>,
    // keyed by (inner session, inner rpc id)
    relays: HashMap<(SessionId, RpcId), Relay>,
    events: VecDeque<FiberEvent>,
}

impl Fiber {
    pub fn builder(config: FiberConfig, kinds: Arc<MessageKinds>) -> FiberBuilder {
        FiberBuilder::new(config, kinds)
    }

    pub fn config(&self) -> &FiberConfig {
        &self.config
    }

    pub fn kinds(&self) -> &Arc<MessageKinds> {
        &self.kinds
    }

    /// Id source to hand to services created for this fiber
    pub fn ids(&self) -> Arc<dyn IdGenerator> {
        self.ids.clone()
    }

    pub fn now(&self) -> Millis {
        self.clock.now()
    }

    // Services

    /// Attaches a service and returns its index
    pub fn add_service(&mut self, service: Box<dyn Service>) -> usize {
        info!(
            "fiber {} attached {:?} service listening on {:?}",
            self.config.process,
            service.kind(),
            service.local_addr()
        );
        self.services.push(service);
        self.services.len() - 1
    }

    pub fn service(&self, service: usize) -> Option<&dyn Service> {
        self.services.get(service).map(|service| service.as_ref())
    }

    pub fn local_addr(&self, service: usize) -> Option<SocketAddr> {
        self.service(service).and_then(|service| service.local_addr())
    }

    /// Service used to open sessions to processes hosting remote actors
    pub fn set_forward_service(&mut self, service: usize) -> Result<(), FiberError> {
        if service >= self.services.len() {
            return Err(FiberError::ServiceNotFound { service });
        }
        self.forward_service = Some(service);
        Ok(())
    }

    /// Uses an existing session to reach `process`
    pub fn add_route(&mut self, process: ProcessId, session_id: SessionId) -> Result<(), FiberError> {
        if !self.sessions.contains_key(&session_id) {
            return Err(FiberError::SessionNotFound { session_id });
        }
        self.routes.insert(process, session_id);
        Ok(())
    }

    // Sessions

    /// Opens an outgoing session. Frames sent before it connects are queued.
    pub fn connect(&mut self, service: usize, address: SocketAddr) -> Result<SessionId, FiberError> {
        let now = self.clock.now();
        let channel_id = self
            .services
            .get_mut(service)
            .ok_or(FiberError::ServiceNotFound { service })?
            .connect_channel(address)?;
        let session = Session::new(
            channel_id,
            service,
            ChannelKind::Outgoing,
            address,
            self.kinds.clone(),
            now,
        );
        self.sessions.insert(channel_id, session);
        debug!("session {} connecting to {}", channel_id, address);
        Ok(channel_id)
    }

    pub fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Disposes a session, failing its pending calls with `SESSION_DISPOSED`
    pub fn close_session(&mut self, session_id: SessionId) -> bool {
        self.remove_session(session_id, ErrorCode::SESSION_DISPOSED)
    }

    pub fn send(&mut self, session_id: SessionId, envelope: &Envelope) -> Result<(), FiberError> {
        let now = self.clock.now();
        let (session, service) = self.session_and_service(session_id)?;
        session.send(service, envelope, now)?;
        Ok(())
    }

    pub fn send_message<M: NetMessage>(
        &mut self,
        session_id: SessionId,
        message: &M,
    ) -> Result<(), FiberError> {
        let envelope = Envelope::from_message(message)?;
        self.send(session_id, &envelope)
    }

    pub fn send_actor_message<M: NetMessage>(
        &mut self,
        session_id: SessionId,
        actor_id: ActorId,
        message: &M,
    ) -> Result<(), FiberError> {
        let envelope = Envelope::from_message(message)?.with_actor(actor_id);
        self.send(session_id, &envelope)
    }

    pub fn call(
        &mut self,
        session_id: SessionId,
        envelope: Envelope,
    ) -> Result<ResponseFuture, FiberError> {
        let now = self.clock.now();
        let (session, service) = self.session_and_service(session_id)?;
        Ok(session.call(service, envelope, now)?)
    }

    pub fn call_request<Q: NetRequest>(
        &mut self,
        session_id: SessionId,
        request: &Q,
    ) -> Result<TypedResponse<Q::Response>, FiberError> {
        let now = self.clock.now();
        let (session, service) = self.session_and_service(session_id)?;
        Ok(session.call_request(service, request, now)?)
    }

    pub fn call_actor<Q: NetRequest>(
        &mut self,
        session_id: SessionId,
        actor_id: ActorId,
        request: &Q,
    ) -> Result<TypedResponse<Q::Response>, FiberError> {
        let now = self.clock.now();
        let (session, service) = self.session_and_service(session_id)?;
        Ok(session.call_actor(service, actor_id, request, now)?)
    }

    fn session_and_service(
        &mut self,
        session_id: SessionId,
    ) -> Result<(&mut Session, &mut dyn Service), FiberError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(FiberError::SessionNotFound { session_id })?;
        let service = session.service();
        let service = self
            .services
            .get_mut(service)
            .ok_or(FiberError::ServiceNotFound { service })?;
        Ok((session, service.as_mut()))
    }

    // Actors

    /// Hosts `actor_id` here, giving it a mailbox
    pub fn add_actor(&mut self, actor_id: ActorId) -> bool {
        self.mailboxes.register(actor_id)
    }

    /// Stops hosting `actor_id`. Queued requests from remote callers are answered
    /// with `ACTOR_NOT_FOUND`; everything else still queued is returned.
    pub fn remove_actor(&mut self, actor_id: &ActorId) -> Option<Vec<Delivery>> {
        let queued = self.mailboxes.unregister(actor_id)?;
        let mut unanswered = Vec::new();
        for delivery in queued {
            match (delivery.envelope.class, delivery.reply_to) {
                (MessageClass::ActorRequest, Some(session_id)) => self.reject_actor(
                    Some(session_id),
                    &delivery.envelope,
                    ErrorCode::ACTOR_NOT_FOUND,
                ),
                _ => unanswered.push(delivery),
            }
        }
        Some(unanswered)
    }

    pub fn mailbox_len(&self, actor_id: &ActorId) -> usize {
        self.mailboxes.len(actor_id)
    }

    /// Takes every queued delivery for `actor_id` without running handlers.
    /// The caller owns any reply a taken request is still waiting on.
    pub fn take_mailbox(&mut self, actor_id: &ActorId) -> Vec<Delivery> {
        self.mailboxes.drain(actor_id)
    }

    // Timers

    pub fn new_once_timer(&mut self, due: Millis, tag: u64) -> TimerId {
        self.timers.new_once_timer(due, FiberTimer::App(tag))
    }

    pub fn new_repeating_timer(&mut self, period: Millis, tag: u64) -> Result<TimerId, FiberError> {
        Ok(self.timers.new_repeating_timer(period, FiberTimer::App(tag))?)
    }

    pub fn wait_until(&mut self, due: Millis) -> TimerWait {
        self.timers.wait_until(due)
    }

    pub fn wait_for(&mut self, duration: Millis) -> TimerWait {
        self.timers.wait_for(duration)
    }

    /// Cancels an application timer. Internal timers cannot be removed.
    pub fn remove_timer(&mut self, timer_id: TimerId) -> bool {
        if timer_id == self.idle_timer || self.accept_timers.values().any(|id| *id == timer_id) {
            return false;
        }
        self.timers.remove(timer_id)
    }

    // Driving

    /// One scheduler tick: service events, then due timers, then mailboxes
    pub fn update(&mut self) {
        self.poll_services();
        self.fire_timers();
        self.run_mailboxes();
    }

    pub fn receive(&mut self) -> Option<FiberEvent> {
        self.events.pop_front()
    }

    /// Drains every service's event queue
    pub fn poll_services(&mut self) {
        let now = self.clock.now();
        for index in 0..self.services.len() {
            self.services[index].update(now);
            while let Some(event) = self.services[index].receive() {
                self.handle_service_event(index, event);
            }
        }
    }

    /// Fires every timer that is due
    pub fn fire_timers(&mut self) {
        self.timers.tick();
        while let Some(fired) = self.timers.pop_due() {
            match fired.payload {
                FiberTimer::IdleCheck => self.check_idle(),
                FiberTimer::AcceptTimeout(session_id) => {
                    self.accept_timers.remove(&session_id);
                    warn!("session {} sent nothing after being accepted", session_id);
                    self.remove_session(session_id, ErrorCode::SESSION_ACCEPT_TIMEOUT);
                }
                FiberTimer::App(tag) => self.events.push_back(FiberEvent::Timer {
                    timer_id: fired.id,
                    tag,
                }),
            }
        }
    }

    /// Runs actor handlers over the deliveries queued when the call started.
    /// Deliveries queued by those handlers wait for the next call.
    pub fn run_mailboxes(&mut self) {
        let now = self.clock.now();
        for actor_id in self.mailboxes.actors_with_mail() {
            let queued = self.mailboxes.len(&actor_id);
            for _ in 0..queued {
                let Some(delivery) = self.mailboxes.pop(&actor_id) else {
                    break;
                };
                let mut context = HandlerContext::new(now, delivery.reply_to, Some(actor_id));
                let outcome = self.actor_handlers.invoke(&mut context, &delivery.envelope);
                let reply = reply_for(&delivery.envelope, &self.kinds, outcome);
                self.flush_outbox(context.take_outbox());
                match (reply, delivery.reply_to) {
                    (Some(reply), Some(session_id)) => self.send_logged(session_id, &reply),
                    (Some(reply), None) => debug!(
                        "actor {} reply opcode {} has no session to go to",
                        actor_id, reply.opcode
                    ),
                    _ => {}
                }
            }
        }
    }

    /// Closes every session and disposes every service
    pub fn dispose(&mut self) {
        for session_id in self.session_ids() {
            self.remove_session(session_id, ErrorCode::SESSION_DISPOSED);
        }
        for service in self.services.iter_mut() {
            service.dispose();
        }
        info!("fiber for process {} disposed", self.config.process);
    }

    fn handle_service_event(&mut self, service: usize, event: ServiceEvent) {
        let now = self.clock.now();
        match event {
            ServiceEvent::Accepted { channel_id, remote } => {
                let session = Session::new(
                    channel_id,
                    service,
                    ChannelKind::Accepted,
                    remote,
                    self.kinds.clone(),
                    now,
                );
                self.sessions.insert(channel_id, session);
                let due = now.saturating_add(millis(self.config.session.accept_timeout));
                let timer = self
                    .timers
                    .new_once_timer(due, FiberTimer::AcceptTimeout(channel_id));
                self.accept_timers.insert(channel_id, timer);
                info!("session {} accepted from {}", channel_id, remote);
                self.events.push_back(FiberEvent::SessionAccepted {
                    session_id: channel_id,
                    remote,
                });
            }
            ServiceEvent::Connected { channel_id, remote } => {
                if self.sessions.contains_key(&channel_id) {
                    info!("session {} connected to {}", channel_id, remote);
                    self.events.push_back(FiberEvent::SessionConnected {
                        session_id: channel_id,
                        remote,
                    });
                }
            }
            ServiceEvent::Read { channel_id, frame } => {
                if let Some(timer) = self.accept_timers.remove(&channel_id) {
                    self.timers.remove(timer);
                }
                let Some(session) = self.sessions.get_mut(&channel_id) else {
                    debug!("read on channel {} without a session, dropped", channel_id);
                    return;
                };
                if let Inbound::Dispatch(envelope) = session.on_frame(&frame, now) {
                    self.dispatch_inbound(channel_id, envelope);
                }
            }
            ServiceEvent::Error { channel_id, error } => {
                self.remove_session(channel_id, error);
            }
        }
    }

    fn dispatch_inbound(&mut self, session_id: SessionId, envelope: Envelope) {
        match envelope.class {
            MessageClass::Plain | MessageClass::Request => {
                let mut context = HandlerContext::new(self.clock.now(), Some(session_id), None);
                let outcome = self.handlers.invoke(&mut context, &envelope);
                if let (MessageClass::Plain, Err(HandlerError::NotFound { opcode })) =
                    (envelope.class, &outcome)
                {
                    warn!(
                        "no handler for message opcode {} on session {}, dropped",
                        opcode, session_id
                    );
                }
                let reply = reply_for(&envelope, &self.kinds, outcome);
                self.flush_outbox(context.take_outbox());
                if let Some(reply) = reply {
                    self.send_logged(session_id, &reply);
                }
            }
            MessageClass::ActorMessage | MessageClass::ActorRequest => {
                self.route_actor_envelope(Some(session_id), envelope);
            }
            MessageClass::ActorResponse => self.relay_response(session_id, envelope),
            MessageClass::Response => warn!(
                "response opcode {} rpc {} on session {} reached dispatch, dropped",
                envelope.opcode, envelope.rpc_id, session_id
            ),
        }
    }

    fn route_actor_envelope(&mut self, origin: Option<SessionId>, envelope: Envelope) {
        let Some(actor_id) = envelope.actor_id else {
            warn!(
                "actor opcode {} without actor id from {:?}, dropped",
                envelope.opcode, origin
            );
            return;
        };
        let route = route_actor(
            actor_id,
            self.config.process,
            &self.mailboxes,
            self.resolver.as_ref(),
        );
        match route {
            ActorRoute::Local(actor_id) => {
                let delivery = Delivery {
                    envelope,
                    reply_to: origin,
                };
                if let Err(delivery) = self.mailboxes.push(actor_id, delivery) {
                    self.reject_actor(origin, &delivery.envelope, ErrorCode::ACTOR_NOT_FOUND);
                }
            }
            ActorRoute::NotFound(_) => {
                self.reject_actor(origin, &envelope, ErrorCode::ACTOR_NOT_FOUND)
            }
            ActorRoute::Unroutable(_) => {
                self.reject_actor(origin, &envelope, ErrorCode::ACTOR_UNROUTABLE)
            }
            ActorRoute::Forward {
                actor_id,
                process,
                address,
            } => self.forward(origin, envelope, actor_id, process, address),
        }
    }

    fn forward(
        &mut self,
        origin: Option<SessionId>,
        envelope: Envelope,
        actor_id: ActorId,
        process: ProcessId,
        address: SocketAddr,
    ) {
        let inner = match self.route_session(process, address) {
            Ok(inner) => inner,
            Err(err) => {
                warn!("cannot reach process {} for actor {}: {}", process, actor_id, err);
                self.reject_actor(origin, &envelope, ErrorCode::ACTOR_UNROUTABLE);
                return;
            }
        };

        let forwarded = if envelope.class == MessageClass::ActorRequest {
            let (Some(origin), Some(session)) = (origin, self.sessions.get_mut(&inner)) else {
                warn!(
                    "actor request opcode {} for {} has no session to answer, dropped",
                    envelope.opcode, actor_id
                );
                return;
            };
            let inner_rpc = session.reserve_rpc_id();
            self.relays.insert(
                (inner, inner_rpc),
                Relay {
                    origin,
                    origin_rpc: envelope.rpc_id,
                    opcode: envelope.opcode,
                    actor_id,
                },
            );
            rewrite_for_forward(&envelope, Some(inner_rpc))
        } else {
            rewrite_for_forward(&envelope, None)
        };

        debug!(
            "forwarding opcode {} for actor {} to process {} over session {}",
            forwarded.opcode, actor_id, process, inner
        );
        if let Err(err) = self.send(inner, &forwarded) {
            warn!(
                "forwarding opcode {} to process {} failed: {}",
                forwarded.opcode, process, err
            );
            if self.relays.remove(&(inner, forwarded.rpc_id)).is_some() {
                self.reject_actor(origin, &envelope, ErrorCode::ACTOR_UNROUTABLE);
            }
        }
    }

    fn route_session(&mut self, process: ProcessId, address: SocketAddr) -> Result<SessionId, FiberError> {
        if let Some(session_id) = self.routes.get(&process) {
            return Ok(*session_id);
        }
        let service = self
            .forward_service
            .ok_or(FiberError::NoForwardService { process })?;
        let session_id = self.connect(service, address)?;
        self.routes.insert(process, session_id);
        Ok(session_id)
    }

    fn relay_response(&mut self, session_id: SessionId, mut envelope: Envelope) {
        let Some(relay) = self.relays.remove(&(session_id, envelope.rpc_id)) else {
            warn!(
                "actor response opcode {} rpc {} on session {} matches no call, dropped",
                envelope.opcode, envelope.rpc_id, session_id
            );
            return;
        };
        envelope.rpc_id = relay.origin_rpc;
        self.send_logged(relay.origin, &envelope);
    }

    // Answers an actor request that cannot be delivered; messages are just dropped
    fn reject_actor(&mut self, origin: Option<SessionId>, envelope: &Envelope, error: ErrorCode) {
        match (envelope.class, origin) {
            (MessageClass::ActorRequest, Some(session_id)) => {
                let failure = HandlerError::with_code(
                    error,
                    format!("actor {:?} cannot be reached", envelope.actor_id),
                );
                if let Some(reply) = reply_for(envelope, &self.kinds, Err(failure)) {
                    self.send_logged(session_id, &reply);
                }
            }
            _ => warn!(
                "actor opcode {} for {:?} dropped with {}",
                envelope.opcode, envelope.actor_id, error
            ),
        }
    }

    fn flush_outbox(&mut self, outbox: Vec<Outgoing>) {
        for outgoing in outbox {
            match outgoing {
                Outgoing::Session {
                    session_id,
                    envelope,
                } => self.send_logged(session_id, &envelope),
                Outgoing::Actor { envelope } => self.route_actor_envelope(None, envelope),
            }
        }
    }

    fn send_logged(&mut self, session_id: SessionId, envelope: &Envelope) {
        if let Err(err) = self.send(session_id, envelope) {
            warn!(
                "dropped opcode {} rpc {} for session {}: {}",
                envelope.opcode, envelope.rpc_id, session_id, err
            );
        }
    }

    fn check_idle(&mut self) {
        let now = self.clock.now();
        let timeout = millis(self.config.session.idle_timeout);
        let idle: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|session| session.is_idle(now, timeout))
            .map(|session| session.id())
            .collect();
        for session_id in idle {
            warn!("session {} idle for over {} ms", session_id, timeout);
            self.remove_session(session_id, ErrorCode::SESSION_IDLE_TIMEOUT);
        }
    }

    fn remove_session(&mut self, session_id: SessionId, error: ErrorCode) -> bool {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return false;
        };
        session.dispose(error);
        if let Some(timer) = self.accept_timers.remove(&session_id) {
            self.timers.remove(timer);
        }
        if let Some(service) = self.services.get_mut(session.service()) {
            service.remove(session_id);
        }
        self.routes.retain(|_, route| *route != session_id);
        self.fail_relays(session_id);

        info!(
            "session {} to {} closed with {}",
            session_id,
            session.remote(),
            error
        );
        self.events.push_back(FiberEvent::SessionClosed { session_id, error });
        true
    }

    // Forwarded requests through a dead inner session are answered with
    // ACTOR_UNROUTABLE; ones whose caller went away are forgotten
    fn fail_relays(&mut self, session_id: SessionId) {
        let broken: Vec<(SessionId, RpcId)> = self
            .relays
            .keys()
            .filter(|(inner, _)| *inner == session_id)
            .copied()
            .collect();
        for key in broken {
            let Some(relay) = self.relays.remove(&key) else {
                continue;
            };
            let Some(opcode) = self.kinds.response_opcode(relay.opcode) else {
                warn!(
                    "forwarded request opcode {} has no response opcode, caller not answered",
                    relay.opcode
                );
                continue;
            };
            let reply = Envelope::error_response(
                opcode,
                MessageClass::ActorResponse,
                relay.origin_rpc,
                ErrorCode::ACTOR_UNROUTABLE,
                format!("session to the process hosting {} closed", relay.actor_id),
            )
            .with_actor(relay.actor_id);
            self.send_logged(relay.origin, &reply);
        }
        self.relays.retain(|_, relay| relay.origin != session_id);
    }
}
