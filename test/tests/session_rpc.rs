use std::sync::Arc;

use actornet::{
    handler_fn, message_handler, request_handler, FiberEvent, HandlerError, HandlerRegistration,
    RpcError, Service, ServiceEvent,
};
use actornet_shared::{Envelope, ErrorCode, ManualClock, SequentialIdGenerator};
use actornet_test::{
    address, events, local_fiber, protocol, pump,
    test_protocol::{Explode, Exploded, Note, Ping, Pong, Unhandled, UNKNOWN_OPCODE},
    LocalNetwork, LocalService,
};
use parking_lot::Mutex;

fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}

fn echo_handler() -> HandlerRegistration {
    request_handler::<Ping, _>(|_, ping| Ok(Pong { value: ping.value }))
}

/// Raw peer that answers by hand, in whatever order the test wants
fn raw_peer(network: &LocalNetwork, port: u16) -> LocalService {
    network.listen(address(port), Arc::new(SequentialIdGenerator::starting_at(50_000)))
}

fn drain(peer: &mut LocalService) -> (Option<u64>, Vec<Envelope>) {
    let kinds = protocol();
    let mut channel = None;
    let mut requests = Vec::new();
    while let Some(event) = peer.receive() {
        match event {
            ServiceEvent::Accepted { channel_id, .. } => channel = Some(channel_id),
            ServiceEvent::Read { frame, .. } => {
                requests.push(Envelope::from_bytes(&frame, &kinds).unwrap())
            }
            _ => {}
        }
    }
    (channel, requests)
}

fn pong_for(request: &Envelope, value: u32) -> Vec<u8> {
    Envelope::from_message(&Pong { value })
        .unwrap()
        .with_rpc_id(request.rpc_id)
        .to_bytes()
        .unwrap()
}

#[test]
fn echo_request_resolves_and_leaves_no_pending_call() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut server = local_fiber(&network, &clock, 2, Some(address(9000)), |builder| {
        builder.handler(echo_handler())
    });
    let mut client = local_fiber(&network, &clock, 1, None, |builder| builder);

    let session = client.connect(0, address(9000)).unwrap();
    let mut reply = client.call_request(session, &Ping { value: 7 }).unwrap();
    pump(&mut [&mut client, &mut server], 3);

    assert_eq!(reply.try_take(), Some(Ok(Pong { value: 7 })));
    assert_eq!(client.session(session).unwrap().pending_calls(), 0);

    let client_events = events(&mut client);
    assert!(client_events.contains(&FiberEvent::SessionConnected {
        session_id: session,
        remote: address(9000)
    }));
    assert!(events(&mut server)
        .iter()
        .any(|event| matches!(event, FiberEvent::SessionAccepted { .. })));
}

#[test]
fn replies_in_reverse_order_reach_their_own_calls() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut peer = raw_peer(&network, 9001);
    let mut client = local_fiber(&network, &clock, 1, None, |builder| builder);

    let session = client.connect(0, address(9001)).unwrap();
    let mut calls: Vec<_> = (0..5)
        .map(|value| client.call_request(session, &Ping { value }).unwrap())
        .collect();

    let (channel, requests) = drain(&mut peer);
    let channel = channel.unwrap();
    assert_eq!(requests.len(), 5);
    for request in requests.iter().rev() {
        let ping: Ping = request.decode().unwrap();
        peer.send(channel, &pong_for(request, ping.value * 10)).unwrap();
    }
    client.update();

    for (value, call) in calls.iter_mut().enumerate() {
        assert_eq!(
            call.try_take(),
            Some(Ok(Pong {
                value: value as u32 * 10
            }))
        );
    }
    assert_eq!(client.session(session).unwrap().pending_calls(), 0);
}

#[test]
fn duplicate_and_unknown_replies_are_dropped() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut peer = raw_peer(&network, 9002);
    let mut client = local_fiber(&network, &clock, 1, None, |builder| builder);

    let session = client.connect(0, address(9002)).unwrap();
    let mut call = client.call_request(session, &Ping { value: 1 }).unwrap();
    let (channel, requests) = drain(&mut peer);
    let channel = channel.unwrap();

    peer.send(channel, &pong_for(&requests[0], 1)).unwrap();
    peer.send(channel, &pong_for(&requests[0], 2)).unwrap();
    let stray = Envelope::from_message(&Pong { value: 3 })
        .unwrap()
        .with_rpc_id(4_000);
    peer.send(channel, &stray.to_bytes().unwrap()).unwrap();
    client.update();

    assert_eq!(call.try_take(), Some(Ok(Pong { value: 1 })));
    // the session survives and keeps correlating
    let mut second = client.call_request(session, &Ping { value: 9 }).unwrap();
    let (_, requests) = drain(&mut peer);
    peer.send(channel, &pong_for(&requests[0], 9)).unwrap();
    client.update();
    assert_eq!(second.try_take(), Some(Ok(Pong { value: 9 })));
}

#[test]
fn closing_a_session_fails_every_pending_call() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let _peer = raw_peer(&network, 9003);
    let mut client = local_fiber(&network, &clock, 1, None, |builder| builder);

    let session = client.connect(0, address(9003)).unwrap();
    let mut calls: Vec<_> = (0..4)
        .map(|value| client.call_request(session, &Ping { value }).unwrap())
        .collect();

    assert!(client.close_session(session));
    for call in calls.iter_mut() {
        assert_eq!(
            call.try_take(),
            Some(Err(RpcError::Disconnected {
                session_id: session,
                error: ErrorCode::SESSION_DISPOSED
            }))
        );
    }
    assert!(client.session(session).is_none());
    assert!(!client.close_session(session));
}

#[test]
fn peer_crash_fails_pending_calls_with_transport_error() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut peer = raw_peer(&network, 9004);
    let mut client = local_fiber(&network, &clock, 1, None, |builder| builder);

    let session = client.connect(0, address(9004)).unwrap();
    let mut call = client.call_request(session, &Ping { value: 1 }).unwrap();
    client.update();
    drain(&mut peer);
    network.crash(address(9004));
    client.update();

    assert_eq!(
        call.try_take(),
        Some(Err(RpcError::Disconnected {
            session_id: session,
            error: ErrorCode::PEER_DISCONNECT
        }))
    );
    assert!(events(&mut client).contains(&FiberEvent::SessionClosed {
        session_id: session,
        error: ErrorCode::PEER_DISCONNECT
    }));
}

#[test]
fn failing_handler_answers_with_error_response() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut server = local_fiber(&network, &clock, 2, Some(address(9005)), |builder| {
        builder.handler(request_handler::<Explode, _>(|_, explode| {
            if explode.reason == "panic" {
                panic!("handler panicked on purpose");
            }
            Err::<Exploded, _>(HandlerError::new(explode.reason))
        }))
    });
    let mut client = local_fiber(&network, &clock, 1, None, |builder| builder);

    let session = client.connect(0, address(9005)).unwrap();
    let mut failed = client
        .call_request(
            session,
            &Explode {
                reason: "out of mana".to_string(),
            },
        )
        .unwrap();
    let mut panicked = client
        .call_request(
            session,
            &Explode {
                reason: "panic".to_string(),
            },
        )
        .unwrap();
    let mut unhandled = client.call_request(session, &Unhandled).unwrap();
    pump(&mut [&mut client, &mut server], 3);

    assert_eq!(
        failed.try_take(),
        Some(Err(RpcError::Remote {
            code: ErrorCode::RPC_FAIL,
            message: "out of mana".to_string()
        }))
    );
    match panicked.try_take() {
        Some(Err(RpcError::Remote { code, message })) => {
            assert_eq!(code, ErrorCode::RPC_FAIL);
            assert!(message.contains("handler panicked on purpose"));
        }
        _ => panic!("a panicking handler should come back as a remote error"),
    }
    match unhandled.try_take() {
        Some(Err(RpcError::Remote { code, .. })) => assert_eq!(code, ErrorCode::HANDLER_NOT_FOUND),
        _ => panic!("unhandled request should fail with HANDLER_NOT_FOUND"),
    }
    // the server kept running
    assert_eq!(server.session_count(), 1);
}

#[test]
fn unknown_opcode_is_dropped_without_closing_the_session() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let notes = Arc::new(Mutex::new(Vec::new()));
    let recorded = notes.clone();
    let mut client = local_fiber(&network, &clock, 1, None, move |builder| {
        builder.handler(message_handler::<Note, _>(move |_, note| {
            recorded.lock().push(note.text);
            Ok(())
        }))
    });
    let mut peer = raw_peer(&network, 9006);

    let session = client.connect(0, address(9006)).unwrap();
    client.update();
    let channel = drain(&mut peer).0.unwrap();

    let mut unknown = UNKNOWN_OPCODE.to_le_bytes().to_vec();
    unknown.extend_from_slice(b"garbage");
    peer.send(channel, &unknown).unwrap();
    let note = Envelope::from_message(&Note {
        text: "still here".to_string(),
    })
    .unwrap();
    peer.send(channel, &note.to_bytes().unwrap()).unwrap();
    client.update();

    assert_eq!(*notes.lock(), vec!["still here".to_string()]);
    assert!(client.session(session).is_some());
    assert!(!events(&mut client)
        .iter()
        .any(|event| matches!(event, FiberEvent::SessionClosed { .. })));
}

#[test]
fn handler_outbox_reaches_other_sessions() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    // bounces every note back to its sender through the handler outbox
    let mut server = local_fiber(&network, &clock, 2, Some(address(9007)), |builder| {
        builder.handler(HandlerRegistration::new(
            12,
            "note echo",
            handler_fn(|context, envelope| {
                let session_id = context.session_id().expect("notes arrive on sessions");
                context.send(session_id, envelope.clone());
                Ok(None)
            }),
        ))
    });
    let notes = Arc::new(Mutex::new(Vec::new()));
    let recorded = notes.clone();
    let mut client = local_fiber(&network, &clock, 1, None, move |builder| {
        builder.handler(message_handler::<Note, _>(move |_, note| {
            recorded.lock().push(note.text);
            Ok(())
        }))
    });

    let session = client.connect(0, address(9007)).unwrap();
    client
        .send_message(
            session,
            &Note {
                text: "hello".to_string(),
            },
        )
        .unwrap();
    pump(&mut [&mut client, &mut server], 3);

    assert_eq!(*notes.lock(), vec!["hello".to_string()]);
}
