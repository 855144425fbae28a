use std::sync::Arc;

use actornet::{FiberEvent, Service, ServiceEvent};
use actornet_shared::{
    Envelope, ErrorCode, ManualClock, SequentialIdGenerator, WaitOutcome,
};
use actornet_test::{
    address, closed, events, local_fiber, pump, test_protocol::Note, LocalNetwork,
};

fn init_logger() {
    env_logger::builder().is_test(true).try_init().ok();
}

fn note(text: &str) -> Note {
    Note {
        text: text.to_string(),
    }
}

#[test]
fn silent_accepted_session_hits_accept_timeout() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut server = local_fiber(&network, &clock, 2, Some(address(9300)), |builder| builder);
    let mut raw = network.client(Arc::new(SequentialIdGenerator::starting_at(70_000)));

    let channel = raw.connect_channel(address(9300)).unwrap();
    server.update();
    let session = match events(&mut server).as_slice() {
        [FiberEvent::SessionAccepted { session_id, .. }] => *session_id,
        other => panic!("expected one accepted session, got {:?}", other),
    };

    clock.advance(4_999);
    server.update();
    assert!(server.session(session).is_some());

    clock.advance(2);
    server.update();
    assert_eq!(
        closed(&events(&mut server)),
        vec![(session, ErrorCode::SESSION_ACCEPT_TIMEOUT)]
    );

    // the connector sees the channel die
    let mut saw_error = false;
    while let Some(event) = raw.receive() {
        if let ServiceEvent::Error { channel_id, error } = event {
            assert_eq!(channel_id, channel);
            assert_eq!(error, ErrorCode::PEER_DISCONNECT);
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[test]
fn first_frame_cancels_accept_timeout() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut server = local_fiber(&network, &clock, 2, Some(address(9301)), |builder| builder);
    let mut raw = network.client(Arc::new(SequentialIdGenerator::starting_at(70_000)));

    let channel = raw.connect_channel(address(9301)).unwrap();
    let frame = Envelope::from_message(&note("hi")).unwrap().to_bytes().unwrap();
    raw.send(channel, &frame).unwrap();
    server.update();

    clock.advance(10_000);
    server.update();
    assert!(closed(&events(&mut server)).is_empty());
    assert_eq!(server.session_count(), 1);
}

#[test]
fn idle_sessions_are_closed_on_both_ends() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut server = local_fiber(&network, &clock, 2, Some(address(9302)), |builder| builder);
    let mut client = local_fiber(&network, &clock, 1, None, |builder| builder);

    let session = client.connect(0, address(9302)).unwrap();
    client.send_message(session, &note("hello")).unwrap();
    pump(&mut [&mut client, &mut server], 2);
    events(&mut client);
    events(&mut server);

    clock.advance(30_000);
    pump(&mut [&mut client, &mut server], 1);
    assert!(client.session(session).is_some());

    clock.advance(2_000);
    pump(&mut [&mut client, &mut server], 1);
    assert_eq!(
        closed(&events(&mut client)),
        vec![(session, ErrorCode::SESSION_IDLE_TIMEOUT)]
    );
    assert_eq!(server.session_count(), 0);
}

#[test]
fn one_way_traffic_keeps_both_ends_alive() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut server = local_fiber(&network, &clock, 2, Some(address(9303)), |builder| builder);
    let mut client = local_fiber(&network, &clock, 1, None, |builder| builder);

    let session = client.connect(0, address(9303)).unwrap();
    for round in 0..6 {
        client
            .send_message(session, &note(&format!("tick {}", round)))
            .unwrap();
        pump(&mut [&mut client, &mut server], 1);
        clock.advance(10_000);
    }
    pump(&mut [&mut client, &mut server], 1);

    assert!(client.session(session).is_some());
    assert_eq!(server.session_count(), 1);
    assert!(closed(&events(&mut server)).is_empty());
}

#[test]
fn application_timers_fire_until_removed() {
    init_logger();
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut fiber = local_fiber(&network, &clock, 1, None, |builder| builder);

    let repeating = fiber.new_repeating_timer(100, 7).unwrap();
    let once = fiber.new_once_timer(150, 8);
    let mut wait = fiber.wait_for(50);

    clock.set(100);
    fiber.update();
    assert_eq!(wait.try_take(), Some(WaitOutcome::Elapsed));
    assert_eq!(
        events(&mut fiber),
        vec![FiberEvent::Timer {
            timer_id: repeating,
            tag: 7
        }]
    );

    clock.set(200);
    fiber.update();
    let fired = events(&mut fiber);
    assert!(fired.contains(&FiberEvent::Timer {
        timer_id: once,
        tag: 8
    }));
    assert!(fired.contains(&FiberEvent::Timer {
        timer_id: repeating,
        tag: 7
    }));

    assert!(fiber.remove_timer(repeating));
    clock.set(1_000);
    fiber.update();
    assert!(events(&mut fiber).is_empty());
    assert!(fiber.new_repeating_timer(0, 1).is_err());
}

#[test]
fn cancelled_wait_resolves_as_cancelled() {
    let network = LocalNetwork::new();
    let clock = ManualClock::new(0);
    let mut fiber = local_fiber(&network, &clock, 1, None, |builder| builder);
    let mut wait = fiber.wait_for(1_000);
    assert_eq!(wait.try_take(), None);
    assert!(fiber.remove_timer(wait.id()));
    assert_eq!(wait.try_take(), Some(WaitOutcome::Cancelled));
}
