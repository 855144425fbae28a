use std::{
    net::SocketAddr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use actornet::{Fiber, FiberBuilder, FiberEvent};
use actornet_shared::{
    ErrorCode, FiberConfig, ManualClock, ProcessId, SequentialIdGenerator, SessionId,
};

use crate::{local_network::LocalNetwork, test_protocol::protocol};

pub fn address(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn config(process: ProcessId) -> FiberConfig {
    FiberConfig {
        process,
        ..FiberConfig::default()
    }
}

/// Fiber on a [`LocalNetwork`] driven by `clock`. Service 0 listens on
/// `listen` when given, otherwise it only connects out.
pub fn local_fiber(
    network: &LocalNetwork,
    clock: &ManualClock,
    process: ProcessId,
    listen: Option<SocketAddr>,
    configure: impl FnOnce(FiberBuilder) -> FiberBuilder,
) -> Fiber {
    // offset ids per process so sessions are easy to tell apart in logs
    let ids = Arc::new(SequentialIdGenerator::starting_at(u64::from(process) * 1_000 + 1));
    let builder = Fiber::builder(config(process), protocol())
        .clock(Arc::new(clock.clone()))
        .ids(ids.clone());
    let mut fiber = configure(builder)
        .build()
        .unwrap_or_else(|err| panic!("test fiber failed to build: {}", err));
    let service = match listen {
        Some(address) => network.listen(address, ids),
        None => network.client(ids),
    };
    fiber.add_service(Box::new(service));
    fiber
}

/// Runs `rounds` updates of every fiber, in order
pub fn pump(fibers: &mut [&mut Fiber], rounds: usize) {
    for _ in 0..rounds {
        for fiber in fibers.iter_mut() {
            fiber.update();
        }
    }
}

/// Updates every fiber until `done` holds or `timeout` passes. For real sockets.
pub fn pump_until(
    fibers: &mut [&mut Fiber],
    timeout: Duration,
    mut done: impl FnMut(&mut [&mut Fiber]) -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        for fiber in fibers.iter_mut() {
            fiber.update();
        }
        if done(fibers) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

pub fn events(fiber: &mut Fiber) -> Vec<FiberEvent> {
    let mut events = Vec::new();
    while let Some(event) = fiber.receive() {
        events.push(event);
    }
    events
}

/// Ids of sessions closed in `events`, with their error
pub fn closed(events: &[FiberEvent]) -> Vec<(SessionId, ErrorCode)> {
    events
        .iter()
        .filter_map(|event| match event {
            FiberEvent::SessionClosed { session_id, error } => Some((*session_id, *error)),
            _ => None,
        })
        .collect()
}
