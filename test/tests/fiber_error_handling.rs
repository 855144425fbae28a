use std::time::Duration;

use actornet::{
    actor_message_handler, message_handler, request_handler, DispatchError, Fiber, FiberError,
};
use actornet_shared::{ConfigError, FiberConfig, MessageClass, ProtocolError};
use actornet_test::{
    protocol,
    test_protocol::{Move, Note, Ping, Pong},
};

#[test]
fn duplicate_handler_opcode_refuses_to_start() {
    let result = Fiber::builder(FiberConfig::default(), protocol())
        .handler(request_handler::<Ping, _>(|_, ping| Ok(Pong { value: ping.value })))
        .handler(request_handler::<Ping, _>(|_, _| Ok(Pong { value: 0 })))
        .build();

    match result {
        Err(FiberError::Dispatch(DispatchError::Duplicate(ProtocolError::DuplicateOpcode {
            opcode,
            ..
        }))) => assert_eq!(opcode, 10),
        _ => panic!("Should have failed with a duplicate opcode error"),
    }
}

#[test]
fn response_handler_is_rejected() {
    let result = Fiber::builder(FiberConfig::default(), protocol())
        .handler(message_handler::<Pong, _>(|_, _| Ok(())))
        .build();

    match result {
        Err(FiberError::Dispatch(DispatchError::ClassMismatch { opcode, class, .. })) => {
            assert_eq!(opcode, 11);
            assert_eq!(class, MessageClass::Response);
        }
        _ => panic!("Should have refused a handler for a response opcode"),
    }
}

#[test]
fn actor_handler_in_session_table_is_rejected() {
    let result = Fiber::builder(FiberConfig::default(), protocol())
        .handler(actor_message_handler::<Move, _>(|_, _, _| Ok(())))
        .build();

    match result {
        Err(FiberError::Dispatch(DispatchError::ClassMismatch { table, .. })) => {
            assert_eq!(table, "session")
        }
        _ => panic!("Should have refused an actor handler in the session table"),
    }
}

#[test]
fn handler_for_unregistered_opcode_is_rejected() {
    let mut protocol = actornet_shared::Protocol::builder();
    protocol.add_message::<Move>();
    let result = Fiber::builder(FiberConfig::default(), protocol.build())
        .handler(message_handler::<Note, _>(|_, _| Ok(())))
        .build();

    match result {
        Err(FiberError::Dispatch(DispatchError::UnregisteredOpcode { opcode, .. })) => {
            assert_eq!(opcode, 12)
        }
        _ => panic!("Should have refused a handler the protocol does not know"),
    }
}

#[test]
fn invalid_config_refuses_to_start() {
    let mut config = FiberConfig::default();
    config.session.idle_timeout = Duration::ZERO;
    let result = Fiber::builder(config, protocol()).build();

    match result {
        Err(FiberError::Config(ConfigError::Zero { field })) => {
            assert_eq!(field, "session.idle_timeout")
        }
        _ => panic!("Should have refused a zero idle timeout"),
    }
}

#[test]
fn operations_on_missing_sessions_fail() {
    let mut fiber = Fiber::builder(FiberConfig::default(), protocol())
        .build()
        .unwrap();
    match fiber.send_message(42, &Note { text: String::new() }) {
        Err(FiberError::SessionNotFound { session_id }) => assert_eq!(session_id, 42),
        _ => panic!("Should have failed for an unknown session"),
    }
    match fiber.connect(3, "127.0.0.1:1".parse().unwrap()) {
        Err(FiberError::ServiceNotFound { service }) => assert_eq!(service, 3),
        _ => panic!("Should have failed for an unknown service"),
    }
    assert!(fiber.set_forward_service(0).is_err());
}
