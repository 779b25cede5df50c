mod common;

use common::{CaptureLogger, CountingStack};
use mill_port::{
    subsystem::Subsystem, trace::LogLevel, ClientHandle, Environment, Ip4Address, NetworkAddress,
    NetworkError, Socket, SocketKind,
};
use std::{
    net::{TcpListener, TcpStream},
    sync::{Arc, Barrier},
    thread,
};

fn connected_stream() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    (client, accepted)
}

#[test]
fn test_subsystem_started_once_for_many_environments() {
    let stack = CountingStack::default();
    let subsystem = Arc::new(Subsystem::new(stack.clone()));

    for round in 1..=2 {
        let envs: Vec<Environment> = (0..8)
            .map(|_| Environment::builder().subsystem(subsystem.clone()).build())
            .collect();

        assert!(envs.iter().all(Environment::is_valid));
        assert_eq!(subsystem.stats().live, 8);
        assert_eq!(stack.startups(), round);
        assert_eq!(stack.cleanups(), round - 1);

        drop(envs);
        assert_eq!(stack.cleanups(), round);
        assert!(!subsystem.is_initialized());
    }
}

#[test]
fn test_environments_dropped_from_many_threads() {
    let stack = CountingStack::default();
    let subsystem = Arc::new(Subsystem::new(stack.clone()));
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let env = Environment::builder().subsystem(subsystem.clone()).build();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                drop(env);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(stack.startups(), 1);
    assert_eq!(stack.cleanups(), 1);
    assert_eq!(subsystem.stats().live, 0);
}

#[test]
fn test_failed_startup_is_logged_and_never_cleaned() {
    let stack = CountingStack::failing();
    let logger = Arc::new(CaptureLogger::default());
    let subsystem = Arc::new(Subsystem::new(stack.clone()));

    let env = Environment::builder()
        .subsystem(subsystem.clone())
        .logger(logger.clone())
        .build();

    assert!(!env.is_valid());
    assert_eq!(subsystem.init_error(), Some(std::io::ErrorKind::Unsupported));
    assert!(logger.contains(LogLevel::Error, "networking subsystem"));

    drop(env);
    assert_eq!(stack.cleanups(), 0);
}

#[test]
fn test_listen_without_factory_creates_nothing() {
    let logger = Arc::new(CaptureLogger::default());
    let env = Environment::builder()
        .subsystem(Arc::new(Subsystem::new(CountingStack::default())))
        .logger(logger.clone())
        .build();

    let result = env.listen(&Ip4Address::loopback(0), SocketKind::Stream, None);

    assert!(matches!(result, Err(NetworkError::InvalidArgument(_))));
    assert_eq!(env.socket_count(), 0);
    assert_eq!(logger.count(LogLevel::Error), 1);
}

#[test]
fn test_close_from_other_environment_leaves_registry_alone() {
    let subsystem = Arc::new(Subsystem::new(CountingStack::default()));
    let owner = Environment::builder().subsystem(subsystem.clone()).build();
    let logger = Arc::new(CaptureLogger::default());
    let stranger = Environment::builder()
        .subsystem(subsystem)
        .logger(logger.clone())
        .build();

    let (_client, accepted) = connected_stream();
    let socket = owner.attach_client_socket(
        ClientHandle::try_from(accepted).unwrap(),
        NetworkAddress::default(),
        SocketKind::Stream,
    );

    stranger.close(socket.as_ref());

    assert!(socket.is_valid());
    assert!(owner.owns(socket.as_ref()));
    assert_eq!(owner.socket_count(), 1);
    assert_eq!(stranger.socket_count(), 0);
    assert!(logger.contains(LogLevel::Warn, "unowned"));
}

#[test]
fn test_closed_client_reports_not_connected() {
    let env = Environment::builder()
        .subsystem(Arc::new(Subsystem::new(CountingStack::default())))
        .build();
    let (_client, accepted) = connected_stream();
    let socket = env.attach_client_socket(
        ClientHandle::try_from(accepted).unwrap(),
        NetworkAddress::default(),
        SocketKind::Stream,
    );

    socket.close();
    let mut buf = [0u8; 8];
    let err = socket.read(&mut buf).unwrap_err();

    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    assert_eq!(socket.last_error(), mill_port::LastError::NotSocket);
}
