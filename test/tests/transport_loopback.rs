use std::{
    io::Write,
    net::{SocketAddr, TcpStream, UdpSocket},
    sync::Arc,
    time::Duration,
};

use actornet::{
    request_handler,
    shared::{IdGenerator, TransportConfig},
    transport::{reliable::Packet, ReliableService, TcpService, WebSocketService},
    Fiber, FiberEvent, Service,
};
use actornet_shared::{ErrorCode, FiberConfig, ManualClock, Millis};
use actornet_test::{
    closed, config, events, protocol, pump_until,
    test_protocol::{Note, Ping, Pong},
};

const WAIT: Duration = Duration::from_secs(10);

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn build(config: FiberConfig, clock: Option<&ManualClock>) -> Fiber {
    let mut builder = Fiber::builder(config, protocol()).handler(request_handler::<Ping, _>(|_, ping| {
        Ok(Pong {
            value: ping.value * 2,
        })
    }));
    if let Some(clock) = clock {
        builder = builder.clock(Arc::new(clock.clone()));
    }
    builder.build().unwrap()
}

fn fiber(process: u32) -> Fiber {
    build(config(process), None)
}

/// Pumps `fiber` until one of its sessions closes, returning the error
fn wait_for_close(fiber: &mut Fiber) -> Option<ErrorCode> {
    let mut error = None;
    pump_until(&mut [fiber], WAIT, |fibers| {
        if let Some((_, code)) = closed(&events(fibers[0])).first() {
            error = Some(*code);
        }
        error.is_some()
    });
    error
}

fn connect_timeout(fiber: &Fiber) -> Millis {
    fiber.config().transport.connect_timeout.as_millis() as Millis
}

type MakeService = fn(Option<SocketAddr>, &TransportConfig, Arc<dyn IdGenerator>) -> Box<dyn Service>;

fn tcp(listen: Option<SocketAddr>, config: &TransportConfig, ids: Arc<dyn IdGenerator>) -> Box<dyn Service> {
    match listen {
        Some(address) => Box::new(TcpService::listen(address, config, ids).unwrap()),
        None => Box::new(TcpService::client(config, ids).unwrap()),
    }
}

fn websocket(
    listen: Option<SocketAddr>,
    config: &TransportConfig,
    ids: Arc<dyn IdGenerator>,
) -> Box<dyn Service> {
    match listen {
        Some(address) => Box::new(WebSocketService::listen(address, config, ids).unwrap()),
        None => Box::new(WebSocketService::client(config, ids).unwrap()),
    }
}

fn reliable(
    listen: Option<SocketAddr>,
    config: &TransportConfig,
    ids: Arc<dyn IdGenerator>,
) -> Box<dyn Service> {
    let address = listen.unwrap_or_else(any_port);
    Box::new(ReliableService::bind(address, config, ids).unwrap())
}

fn ping_pong(make: MakeService) {
    env_logger::builder().is_test(true).try_init().ok();

    let mut server = fiber(1);
    let service = make(Some(any_port()), &server.config().transport, server.ids());
    server.add_service(service);
    let server_address = server.local_addr(0).unwrap();

    let mut client = fiber(2);
    let service = make(None, &client.config().transport, client.ids());
    client.add_service(service);
    let session_id = client.connect(0, server_address).unwrap();

    let mut response = client.call_request(session_id, &Ping { value: 21 }).unwrap();
    let mut reply = None;
    let answered = pump_until(&mut [&mut server, &mut client], WAIT, |_| {
        if reply.is_none() {
            reply = response.try_take();
        }
        reply.is_some()
    });
    assert!(answered, "no reply within {:?}", WAIT);
    assert_eq!(reply.unwrap().unwrap(), Pong { value: 42 });

    let server_events = events(&mut server);
    assert!(server_events
        .iter()
        .any(|event| matches!(event, FiberEvent::SessionAccepted { .. })));
    assert_eq!(server.session_count(), 1);

    // closing the client side ends the server's session too
    assert!(client.close_session(session_id));
    let closed = pump_until(&mut [&mut server, &mut client], WAIT, |fibers| {
        fibers[0].session_count() == 0
    });
    assert!(closed, "server kept the session after the client left");
    let server_events = events(&mut server);
    assert!(server_events.iter().any(|event| matches!(
        event,
        FiberEvent::SessionClosed {
            error: ErrorCode::PEER_DISCONNECT | ErrorCode::SOCKET_ERROR,
            ..
        }
    )));
}

#[test]
fn tcp_ping_pong() {
    ping_pong(tcp);
}

#[test]
fn websocket_ping_pong() {
    ping_pong(websocket);
}

#[test]
fn reliable_udp_ping_pong() {
    ping_pong(reliable);
}

#[test]
fn tcp_connect_to_closed_port_fails_the_session() {
    env_logger::builder().is_test(true).try_init().ok();

    // bind then drop to find a port nothing listens on
    let address = std::net::TcpListener::bind(any_port())
        .unwrap()
        .local_addr()
        .unwrap();

    let mut client = fiber(2);
    let service = tcp(None, &client.config().transport, client.ids());
    client.add_service(service);
    let session_id = client.connect(0, address).unwrap();

    let mut failure = None;
    let failed = pump_until(&mut [&mut client], WAIT, |fibers| {
        for event in events(fibers[0]) {
            if let FiberEvent::SessionClosed { session_id: id, error } = event {
                failure = Some((id, error));
            }
        }
        failure.is_some()
    });
    assert!(failed);
    let (id, error) = failure.unwrap();
    assert_eq!(id, session_id);
    assert!(
        error == ErrorCode::CONNECT_FAILED || error == ErrorCode::PEER_DISCONNECT,
        "unexpected error {:?}",
        error
    );
}

fn tcp_server_rejects(bytes: &[u8]) -> Option<ErrorCode> {
    env_logger::builder().is_test(true).try_init().ok();

    let mut server = fiber(1);
    let service = tcp(Some(any_port()), &server.config().transport, server.ids());
    server.add_service(service);
    let mut stream = TcpStream::connect(server.local_addr(0).unwrap()).unwrap();
    stream.write_all(bytes).unwrap();
    // keep the peer open so the close is caused by the bad frame
    let error = wait_for_close(&mut server);
    drop(stream);
    error
}

#[test]
fn tcp_frame_over_the_size_limit_closes_the_session() {
    let declared = (FiberConfig::default().transport.max_frame_size + 1) as u32;
    let mut bytes = declared.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 16]);
    assert_eq!(tcp_server_rejects(&bytes), Some(ErrorCode::PACKET_TOO_LARGE));
}

#[test]
fn tcp_frame_without_an_opcode_closes_the_session() {
    let mut bytes = 1u32.to_le_bytes().to_vec();
    bytes.push(7);
    assert_eq!(tcp_server_rejects(&bytes), Some(ErrorCode::DECODE_FAILED));
}

#[test]
fn websocket_message_over_the_size_limit_closes_the_session() {
    env_logger::builder().is_test(true).try_init().ok();

    let mut small = config(1);
    small.transport.max_frame_size = 64;
    let mut server = build(small, None);
    let service = websocket(Some(any_port()), &server.config().transport, server.ids());
    server.add_service(service);

    let mut client = fiber(2);
    let service = websocket(None, &client.config().transport, client.ids());
    client.add_service(service);
    let session_id = client.connect(0, server.local_addr(0).unwrap()).unwrap();
    client
        .send_message(session_id, &Note { text: "x".repeat(256) })
        .unwrap();

    let mut error = None;
    pump_until(&mut [&mut server, &mut client], WAIT, |fibers| {
        if let Some((_, code)) = closed(&events(fibers[0])).first() {
            error = Some(*code);
        }
        error.is_some()
    });
    assert_eq!(error, Some(ErrorCode::PACKET_TOO_LARGE));
}

#[test]
fn reliable_connect_made_before_the_first_update_survives_a_late_clock() {
    env_logger::builder().is_test(true).try_init().ok();

    let clock = ManualClock::new(100_000);
    let mut server = build(config(1), Some(&clock));
    let service = reliable(Some(any_port()), &server.config().transport, server.ids());
    server.add_service(service);
    let server_address = server.local_addr(0).unwrap();

    let mut client = build(config(2), Some(&clock));
    let service = reliable(None, &client.config().transport, client.ids());
    client.add_service(service);
    let session_id = client.connect(0, server_address).unwrap();

    client.update();
    assert!(closed(&events(&mut client)).is_empty());

    let mut response = client.call_request(session_id, &Ping { value: 5 }).unwrap();
    let mut reply = None;
    let answered = pump_until(&mut [&mut server, &mut client], WAIT, |fibers| {
        assert!(closed(&events(fibers[1])).is_empty());
        if reply.is_none() {
            reply = response.try_take();
        }
        reply.is_some()
    });
    assert!(answered, "no reply within {:?}", WAIT);
    assert_eq!(reply.unwrap().unwrap(), Pong { value: 10 });
}

#[test]
fn reliable_connect_to_a_silent_peer_times_out() {
    env_logger::builder().is_test(true).try_init().ok();

    let silent = UdpSocket::bind(any_port()).unwrap();
    silent.set_read_timeout(Some(WAIT)).unwrap();

    let clock = ManualClock::new(5_000);
    let mut client = build(config(2), Some(&clock));
    let service = reliable(None, &client.config().transport, client.ids());
    client.add_service(service);
    let session_id = client.connect(0, silent.local_addr().unwrap()).unwrap();

    let mut datagram = [0u8; 64];
    let (length, _) = silent.recv_from(&mut datagram).unwrap();
    assert!(matches!(
        Packet::decode(&datagram[..length]),
        Ok(Packet::Syn { .. })
    ));

    client.update();
    clock.advance(connect_timeout(&client) - 1);
    client.update();
    assert!(closed(&events(&mut client)).is_empty());

    clock.advance(1);
    client.update();
    assert_eq!(
        closed(&events(&mut client)),
        vec![(session_id, ErrorCode::CONNECT_TIMEOUT)]
    );
}

#[test]
fn reliable_accept_without_a_first_message_is_dropped_silently() {
    env_logger::builder().is_test(true).try_init().ok();

    let clock = ManualClock::new(1_000);
    let mut server = build(config(1), Some(&clock));
    let service = reliable(Some(any_port()), &server.config().transport, server.ids());
    server.add_service(service);

    let peer = UdpSocket::bind(any_port()).unwrap();
    peer.set_read_timeout(Some(WAIT)).unwrap();
    peer.send_to(
        &Packet::Syn { connector: 9 }.encode(),
        server.local_addr(0).unwrap(),
    )
    .unwrap();

    let waiting = pump_until(&mut [&mut server], WAIT, |fibers| {
        fibers[0]
            .service(0)
            .is_some_and(|service| !service.channel_ids().is_empty())
    });
    assert!(waiting, "SYN never reached the service");

    let mut datagram = [0u8; 64];
    let (length, _) = peer.recv_from(&mut datagram).unwrap();
    assert!(matches!(
        Packet::decode(&datagram[..length]),
        Ok(Packet::Ack { connector: 9, .. })
    ));

    clock.advance(connect_timeout(&server));
    server.update();
    assert!(server
        .service(0)
        .is_some_and(|service| service.channel_ids().is_empty()));
    let server_events = events(&mut server);
    assert!(!server_events.iter().any(|event| matches!(
        event,
        FiberEvent::SessionAccepted { .. } | FiberEvent::SessionClosed { .. }
    )));
    assert_eq!(server.session_count(), 0);
}
