use std::{
    fmt, io,
    net::{Shutdown, SocketAddr},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use mio::{
    net::{TcpListener, UdpSocket},
    Events, Interest, Poll,
};
use socket2::{SockRef, Socket as OsSocket};

use super::{ClientHandle, ClientSocket, LastError, ServerConfig, Socket, SocketCore, SocketId, SocketKind};
use crate::{
    address::NetworkAddress,
    completion::{Completion, CompletionPort, Operation, LISTENER_TOKEN, WAKE_TOKEN},
    context::{CallbackFactory, Context},
    environment::EnvironmentInner,
    error::NetworkError,
    trace::{LogLevel, Logger},
    worker::{run_worker, ThreadGroup},
};

const EVENTS_CAPACITY: usize = 1024;

/// Lifecycle of a [`ServerSocket`].
///
/// ```text
/// Uninitialized ─▶ Initializing ─▶ Listening ─▶ ShuttingDown ─▶ Closed
///                       │
///                       └─▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Uninitialized,
    Initializing,
    Listening,
    ShuttingDown,
    Closed,
    /// Initialization stopped at one of its steps; terminal.
    Failed,
}

enum Endpoint {
    Stream(TcpListener),
    Datagram(UdpSocket),
}

impl Endpoint {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Endpoint::Stream(listener) => listener.local_addr(),
            Endpoint::Datagram(socket) => socket.local_addr(),
        }
    }

    fn shutdown(&self) {
        if let Endpoint::Stream(listener) = self {
            let _ = SockRef::from(listener).shutdown(Shutdown::Both);
        }
    }
}

#[derive(Default)]
struct Resources {
    endpoint: Option<Arc<Endpoint>>,
    port: Option<Arc<CompletionPort>>,
    workers: ThreadGroup,
    listener: ThreadGroup,
}

/// A listening endpoint served by a pool of worker threads.
///
/// Construction runs the whole initialization protocol: create the socket,
/// bind, listen, create the completion port, start the workers, start the
/// listener. A failing step leaves the socket in [`ServerState::Failed`]
/// with [`is_valid`](Socket::is_valid) false and the cause in
/// [`last_error`](Socket::last_error); everything created before the failure
/// is released. A socket that started fewer workers than requested stays
/// valid.
///
/// Shutdown posts one sentinel per worker, waits for them, releases the
/// listening handle and the port, then waits for the listener. Each wait is
/// bounded by [`ServerConfig::shutdown_timeout`]; threads that do not exit in
/// time are logged and abandoned.
pub struct ServerSocket {
    core: SocketCore,
    factory: Arc<dyn CallbackFactory>,
    config: ServerConfig,
    logger: Arc<dyn Logger>,
    state: Mutex<ServerState>,
    resources: Mutex<Resources>,
    stop: Arc<AtomicBool>,
    handle_open: AtomicBool,
    port_open: AtomicBool,
    workers: AtomicUsize,
}

impl ServerSocket {
    pub(crate) fn open(
        owner: Weak<EnvironmentInner>,
        address: NetworkAddress,
        kind: SocketKind,
        factory: Arc<dyn CallbackFactory>,
        config: ServerConfig,
        logger: Arc<dyn Logger>,
    ) -> Arc<Self> {
        let server = Arc::new(Self {
            core: SocketCore::new(owner, address, kind),
            factory,
            config,
            logger,
            state: Mutex::new(ServerState::Uninitialized),
            resources: Mutex::new(Resources::default()),
            stop: Arc::new(AtomicBool::new(false)),
            handle_open: AtomicBool::new(false),
            port_open: AtomicBool::new(false),
            workers: AtomicUsize::new(0),
        });
        server.initialize();
        server
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn lock_resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Worker threads currently serving the port.
    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Address the listening handle is actually bound to.
    pub fn local_address(&self) -> Option<NetworkAddress> {
        let res = self.lock_resources();
        let endpoint = res.endpoint.as_ref()?;
        endpoint.local_addr().ok().map(NetworkAddress::from)
    }

    /// Completions queued and not yet picked up by a worker.
    pub fn pending_completions(&self) -> usize {
        self.lock_resources()
            .port
            .as_ref()
            .map_or(0, |port| port.pending())
    }

    fn initialize(&self) {
        self.set_state(ServerState::Initializing);
        let workers = self.config.worker_count();
        self.logger.log(
            LogLevel::Info,
            &format!(
                "Initializing server socket at {} with {} workers",
                self.core.address(),
                workers
            ),
        );

        let mut res = self.lock_resources();
        match self.start(&mut res, workers) {
            Ok(()) => {
                self.core.set_last_error(LastError::Success);
                self.set_state(ServerState::Listening);
            }
            Err(error) => {
                self.release(&mut res);
                self.core.set_last_error(error);
                self.set_state(ServerState::Failed);
            }
        }
    }

    fn fail(&self, what: &str, err: &io::Error) -> LastError {
        self.logger
            .log(LogLevel::Error, &format!("{}, {}", what, err));
        LastError::from(err)
    }

    fn start(&self, res: &mut Resources, workers: usize) -> Result<(), LastError> {
        let kind = self.core.kind();
        let sockaddr = self
            .core
            .address()
            .to_sockaddr()
            .map_err(|e| self.fail("Invalid socket address", &e))?;

        let socket = OsSocket::new(sockaddr.domain(), kind.socket_type(), Some(kind.protocol()))
            .and_then(|socket| socket.set_nonblocking(true).map(|()| socket))
            .map_err(|e| self.fail("Error creating socket", &e))?;

        socket
            .bind(&sockaddr)
            .map_err(|e| self.fail("Error binding socket", &e))?;

        let mut endpoint = match kind {
            SocketKind::Stream => {
                socket
                    .listen(self.config.backlog)
                    .map_err(|e| self.fail("Error listening on socket", &e))?;
                Endpoint::Stream(TcpListener::from_std(socket.into()))
            }
            SocketKind::Datagram => Endpoint::Datagram(UdpSocket::from_std(socket.into())),
        };

        let port = CompletionPort::new(workers, self.logger.clone())
            .map(Arc::new)
            .map_err(|e| self.fail("Error creating completion port", &e))?;

        if let Endpoint::Stream(listener) = &mut endpoint {
            port.registry()
                .register(listener, LISTENER_TOKEN, Interest::READABLE)
                .map_err(|e| self.fail("Error registering listening socket", &e))?;
        }

        let endpoint = Arc::new(endpoint);
        res.endpoint = Some(Arc::clone(&endpoint));
        self.handle_open.store(true, Ordering::SeqCst);
        res.port = Some(Arc::clone(&port));
        self.port_open.store(true, Ordering::SeqCst);

        let spawner = Arc::clone(&self.config.spawner);
        for id in 0..workers {
            let port = Arc::clone(&port);
            let logger = Arc::clone(&self.logger);
            let spawned = res.workers.spawn(
                spawner.as_ref(),
                format!("mill-port-worker-{id}"),
                move || run_worker(id, port, logger),
            );
            if let Err(e) = spawned {
                self.logger
                    .log(LogLevel::Debug, &format!("Cannot start worker {}: {}", id, e));
            }
        }

        let spawned = res.workers.len();
        if spawned == 0 {
            self.logger.log(LogLevel::Error, "Error creating workers");
            return Err(LastError::Fault);
        }
        if spawned < port.concurrency() {
            self.logger.log(
                LogLevel::Warn,
                &format!(
                    "Not all workers created, requested {}, created {}",
                    port.concurrency(),
                    spawned
                ),
            );
        }
        self.workers.store(spawned, Ordering::SeqCst);

        let poll = port.take_poll().ok_or_else(|| {
            self.fail(
                "Error creating listener thread",
                &io::Error::new(io::ErrorKind::Other, "poller already in use"),
            )
        })?;

        let listener = Listener {
            endpoint,
            port,
            factory: Arc::clone(&self.factory),
            owner: self.core.owner(),
            kind,
            stop: Arc::clone(&self.stop),
            poll_timeout: self.config.poll_timeout,
            logger: Arc::clone(&self.logger),
            datagram: None,
        };
        res.listener
            .spawn(spawner.as_ref(), "mill-port-listener".into(), move || {
                listener.run(poll)
            })
            .map_err(|e| self.fail("Error creating listener thread", &e))?;

        Ok(())
    }

    /// Stops every thread and releases every handle held in `res`. Running it
    /// on already released resources does nothing.
    fn release(&self, res: &mut Resources) {
        let timeout = self.config.shutdown_timeout;

        if !res.workers.is_empty() {
            if let Some(port) = &res.port {
                for _ in 0..res.workers.len() {
                    port.post(Completion::Shutdown);
                }
            }
            if !res.workers.wait(timeout) {
                let err = NetworkError::Timeout(format!(
                    "workers of socket {} did not exit within {:?}",
                    self.core.id(),
                    timeout
                ));
                self.logger.log(LogLevel::Error, &err.to_string());
            }
            res.workers.release();
            self.workers.store(0, Ordering::SeqCst);
        }

        self.stop.store(true, Ordering::SeqCst);
        if let Some(port) = &res.port {
            port.wake();
        }
        if let Some(endpoint) = res.endpoint.take() {
            endpoint.shutdown();
        }
        self.handle_open.store(false, Ordering::SeqCst);

        if let Some(port) = res.port.take() {
            port.close();
        }
        self.port_open.store(false, Ordering::SeqCst);

        if !res.listener.is_empty() {
            if !res.listener.wait(timeout) {
                let err = NetworkError::Timeout(format!(
                    "listener of socket {} did not exit within {:?}",
                    self.core.id(),
                    timeout
                ));
                self.logger.log(LogLevel::Error, &err.to_string());
            }
            res.listener.release();
        }
    }

    /// Runs the shutdown protocol. Idempotent.
    pub(crate) fn shutdown(&self) {
        let mut res = self.lock_resources();
        let failed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ServerState::Listening {
                *state = ServerState::ShuttingDown;
            }
            *state == ServerState::Failed
        };

        self.release(&mut res);
        self.core.set_last_error(LastError::NotSocket);
        if !failed {
            self.set_state(ServerState::Closed);
        }
    }
}

impl Socket for ServerSocket {
    fn id(&self) -> SocketId {
        self.core.id()
    }

    fn kind(&self) -> SocketKind {
        self.core.kind()
    }

    fn address(&self) -> NetworkAddress {
        self.core.address()
    }

    fn last_error(&self) -> LastError {
        self.core.last_error()
    }

    fn is_valid(&self) -> bool {
        self.handle_open.load(Ordering::SeqCst) && self.port_open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.core.close();
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("id", &self.core.id())
            .field("kind", &self.core.kind())
            .field("address", &self.core.address())
            .field("state", &self.state())
            .field("workers", &self.worker_count())
            .finish()
    }
}

/// State moved into the listener thread.
struct Listener {
    endpoint: Arc<Endpoint>,
    port: Arc<CompletionPort>,
    factory: Arc<dyn CallbackFactory>,
    owner: Weak<EnvironmentInner>,
    kind: SocketKind,
    stop: Arc<AtomicBool>,
    poll_timeout: Duration,
    logger: Arc<dyn Logger>,
    // client sharing a datagram endpoint, replaced whenever it is released
    datagram: Option<Arc<ClientSocket>>,
}

impl Listener {
    fn run(mut self, mut poll: Poll) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        self.serve_datagram();

        'poll: while !self.stop.load(Ordering::SeqCst) {
            if let Err(e) = poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.logger
                    .log(LogLevel::Error, &format!("Listener poll failed, {}", e));
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    LISTENER_TOKEN => {
                        if !self.accept_pending() {
                            break 'poll;
                        }
                    }
                    token => self.port.wake_ready(token),
                }
            }

            self.revive_datagram();
        }

        self.logger.log(LogLevel::Debug, "Listener exiting");
    }

    /// Accepts until the backlog is drained. Returns false once the listener
    /// should stop.
    fn accept_pending(&self) -> bool {
        let Endpoint::Stream(listener) = &*self.endpoint else {
            return true;
        };

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    self.on_accept(ClientHandle::Stream(stream), NetworkAddress::from(peer))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return false;
                    }
                    self.logger
                        .log(LogLevel::Error, &format!("Accept error, {}", e));
                    return true;
                }
            }
        }
    }

    fn create_context(&self, address: &NetworkAddress) -> Option<Box<dyn Context>> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.factory.create_context())) {
            Ok(context) => Some(context),
            Err(_) => {
                self.logger.log(
                    LogLevel::Error,
                    &format!("Callback factory panicked, dropping connection from {}", address),
                );
                None
            }
        }
    }

    fn on_accept(&self, handle: ClientHandle, address: NetworkAddress) {
        let Some(owner) = self.owner.upgrade() else {
            self.logger.log(
                LogLevel::Warn,
                &format!("Environment is gone, dropping connection from {}", address),
            );
            return;
        };
        let Some(context) = self.create_context(&address) else {
            return;
        };

        let socket = owner.attach(handle, address, self.kind);
        self.bind(context, socket, address);
    }

    fn serve_datagram(&mut self) {
        let endpoint = Arc::clone(&self.endpoint);
        if let Endpoint::Datagram(socket) = &*endpoint {
            self.datagram = self.open_datagram(socket);
        }
    }

    /// A datagram context that completed or failed closed its client; the
    /// endpoint keeps being served by a new one until the server stops.
    fn revive_datagram(&mut self) {
        let lost = self
            .datagram
            .as_ref()
            .is_some_and(|client| !client.is_valid());
        if !lost || self.stop.load(Ordering::SeqCst) {
            return;
        }
        self.logger.log(
            LogLevel::Debug,
            "Datagram context released, serving the endpoint with a new one",
        );
        self.serve_datagram();
    }

    /// Datagram endpoints have no connections to accept: one context at a
    /// time serves the bound socket itself.
    fn open_datagram(&self, socket: &UdpSocket) -> Option<Arc<ClientSocket>> {
        let owner = self.owner.upgrade()?;
        let handle = SockRef::from(socket)
            .try_clone()
            .and_then(|shared| ClientHandle::from_socket(shared, SocketKind::Datagram));
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.logger.log(
                    LogLevel::Error,
                    &format!("Cannot share datagram socket, {}", e),
                );
                return None;
            }
        };

        let address = socket
            .local_addr()
            .map(NetworkAddress::from)
            .unwrap_or_default();
        let context = self.create_context(&address)?;

        let client = owner.attach(handle, address, SocketKind::Datagram);
        self.bind(context, Arc::clone(&client), address).then_some(client)
    }

    /// Hands a fresh context to the workers. Returns false when the
    /// connection could not be registered and was dropped.
    fn bind(
        &self,
        mut context: Box<dyn Context>,
        socket: Arc<ClientSocket>,
        address: NetworkAddress,
    ) -> bool {
        context.set_address(address);
        context.set_socket(Arc::clone(&socket));

        if let Err(e) = self.port.associate(&socket) {
            self.logger.log(
                LogLevel::Error,
                &format!(
                    "Cannot register socket {} with the completion port, {}",
                    socket.id(),
                    e
                ),
            );
            drop(context);
            socket.release();
            return false;
        }

        self.logger.log(
            LogLevel::Debug,
            &format!("Accepted {} as socket {}", address, socket.id()),
        );
        self.port
            .post(Completion::Ready(Operation { context, socket }));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::Ip4Address,
        context::Transfer,
        error::Result,
        trace::NoOpLogger,
        worker::{OsThreads, ThreadBody, ThreadSpawner},
    };
    use std::thread::JoinHandle;

    struct Idle;

    impl Context for Idle {
        fn set_address(&mut self, _address: NetworkAddress) {}
        fn set_socket(&mut self, _socket: Arc<ClientSocket>) {}
        fn process_transfer(&mut self) -> Result<Transfer> {
            Ok(Transfer::Complete)
        }
    }

    struct Limited(AtomicUsize);

    impl ThreadSpawner for Limited {
        fn spawn(&self, name: String, body: ThreadBody) -> io::Result<JoinHandle<()>> {
            let left = self.0.load(Ordering::SeqCst);
            if left == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "thread limit"));
            }
            self.0.store(left - 1, Ordering::SeqCst);
            OsThreads.spawn(name, body)
        }
    }

    fn factory() -> Arc<dyn CallbackFactory> {
        Arc::new(|| Box::new(Idle) as Box<dyn Context>)
    }

    fn open(address: NetworkAddress, kind: SocketKind, config: ServerConfig) -> Arc<ServerSocket> {
        ServerSocket::open(
            Weak::new(),
            address,
            kind,
            factory(),
            config,
            Arc::new(NoOpLogger),
        )
    }

    fn quick() -> ServerConfig {
        ServerConfig::builder()
            .workers(2)
            .shutdown_timeout(Duration::from_millis(500))
            .poll_timeout(Duration::from_millis(20))
            .build()
    }

    #[test]
    fn test_listening_on_ephemeral_port() {
        let server = open(Ip4Address::loopback(0).into(), SocketKind::Stream, quick());
        assert!(server.is_valid());
        assert_eq!(server.state(), ServerState::Listening);
        assert_eq!(server.worker_count(), 2);
        assert_eq!(server.last_error(), LastError::Success);

        let local = server.local_address().unwrap();
        assert_ne!(local.port(), Some(0));
    }

    #[test]
    fn test_shutdown_twice_is_identical() {
        let server = open(Ip4Address::loopback(0).into(), SocketKind::Stream, quick());

        server.shutdown();
        let first = (server.state(), server.last_error(), server.is_valid(), server.worker_count());
        server.shutdown();
        let second = (server.state(), server.last_error(), server.is_valid(), server.worker_count());

        assert_eq!(first, second);
        assert_eq!(first, (ServerState::Closed, LastError::NotSocket, false, 0));
        assert!(server.local_address().is_none());
    }

    #[test]
    fn test_zero_concurrency_fails_at_queue_creation() {
        let config = ServerConfig::builder().workers(0).build();
        let server = open(Ip4Address::loopback(0).into(), SocketKind::Stream, config);

        assert!(!server.is_valid());
        assert_eq!(server.state(), ServerState::Failed);
        assert!(matches!(
            server.last_error(),
            LastError::Io {
                kind: io::ErrorKind::InvalidInput,
                ..
            }
        ));
        drop(server);
    }

    #[test]
    fn test_no_worker_started_is_a_fault() {
        let config = ServerConfig::builder()
            .workers(3)
            .spawner(Arc::new(Limited(AtomicUsize::new(0))))
            .build();
        let server = open(Ip4Address::loopback(0).into(), SocketKind::Stream, config);

        assert!(!server.is_valid());
        assert_eq!(server.state(), ServerState::Failed);
        assert_eq!(server.last_error(), LastError::Fault);
        assert_eq!(server.worker_count(), 0);
    }

    #[test]
    fn test_missing_listener_thread_fails() {
        // enough for the workers, none left for the listener
        let config = ServerConfig::builder()
            .workers(2)
            .shutdown_timeout(Duration::from_millis(500))
            .spawner(Arc::new(Limited(AtomicUsize::new(2))))
            .build();
        let server = open(Ip4Address::loopback(0).into(), SocketKind::Stream, config);

        assert!(!server.is_valid());
        assert_eq!(server.state(), ServerState::Failed);
        assert_eq!(server.worker_count(), 0);
    }

    #[test]
    fn test_datagram_server_binds_without_listen() {
        let server = open(Ip4Address::loopback(0).into(), SocketKind::Datagram, quick());
        assert!(server.is_valid());
        assert_eq!(server.kind(), SocketKind::Datagram);
        server.shutdown();
        assert!(!server.is_valid());
    }

    #[test]
    fn test_unspecified_family_cannot_create_socket() {
        let server = open(NetworkAddress::default(), SocketKind::Stream, quick());
        assert!(!server.is_valid());
        assert_eq!(server.state(), ServerState::Failed);
        assert!(matches!(server.last_error(), LastError::Io { .. }));
    }
}
