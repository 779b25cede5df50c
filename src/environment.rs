//! Networking environment and socket registry.
//!
//! An [`Environment`] holds the networking subsystem for as long as it lives
//! and owns every socket it creates. Sockets are looked up by [`SocketId`] in
//! a lockfree map, so the listener threads attaching accepted connections
//! and application threads closing sockets never block each other.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use lockfree::map::Map;

use crate::{
    address::NetworkAddress,
    context::CallbackFactory,
    error::NetworkError,
    socket::{ClientHandle, ClientSocket, ServerConfig, ServerSocket, Socket, SocketId, SocketKind},
    subsystem::Subsystem,
    trace::{LogLevel, Logger, TracingLogger},
};

#[derive(Clone)]
enum Entry {
    Client(Arc<ClientSocket>),
    Server(Arc<ServerSocket>),
}

impl Entry {
    fn shutdown(&self) {
        match self {
            Entry::Client(socket) => socket.shutdown(),
            Entry::Server(socket) => socket.shutdown(),
        }
    }
}

pub(crate) struct EnvironmentInner {
    me: Weak<EnvironmentInner>,
    registry: Map<u64, Entry>,
    subsystem: Arc<Subsystem>,
    logger: Arc<dyn Logger>,
    server_config: ServerConfig,
}

impl EnvironmentInner {
    /// Removes the socket from the registry and releases it.
    pub(crate) fn close_id(&self, id: SocketId) {
        if !self.discard(id) {
            let err = NetworkError::NotOwned(id);
            self.logger
                .log(LogLevel::Warn, &format!("Trying to close unowned socket, {}", err));
        }
    }

    /// Like `close_id` for sockets the core releases itself, which may
    /// already have been closed by the application. Returns whether the
    /// socket was still registered.
    pub(crate) fn discard(&self, id: SocketId) -> bool {
        let Some(removed) = self.registry.remove(&id.as_u64()) else {
            return false;
        };
        let entry = removed.val().clone();
        drop(removed);
        entry.shutdown();
        true
    }

    /// Wraps a connected handle and registers it.
    pub(crate) fn attach(
        &self,
        handle: ClientHandle,
        address: NetworkAddress,
        kind: SocketKind,
    ) -> Arc<ClientSocket> {
        if handle.kind() != kind {
            self.logger.log(
                LogLevel::Warn,
                &format!(
                    "Attaching a {:?} handle as a {:?} socket",
                    handle.kind(),
                    kind
                ),
            );
        }
        let socket = Arc::new(ClientSocket::new(self.me.clone(), handle, address, kind));
        self.registry
            .insert(socket.id().as_u64(), Entry::Client(Arc::clone(&socket)));
        socket
    }

    fn contains(&self, id: SocketId) -> bool {
        self.registry.get(&id.as_u64()).is_some()
    }

    /// Releases every socket, servers first so no new connections are
    /// attached while the rest are closed.
    fn close_all(&self) {
        let mut servers = Vec::new();
        let mut clients = Vec::new();
        for guard in self.registry.iter() {
            match guard.val() {
                Entry::Server(_) => servers.push(*guard.key()),
                Entry::Client(_) => clients.push(*guard.key()),
            }
        }

        for key in servers.into_iter().chain(clients) {
            self.discard(SocketId::from_u64(key));
        }
    }
}

/// Networking environment.
///
/// Creating one acquires the networking [`Subsystem`]; dropping it closes
/// every socket it still owns and releases the subsystem. Any number of
/// environments may be alive at once, on any thread.
///
/// ```rust,no_run
/// use mill_port::{Context, Environment, Ip4Address, SocketKind, Socket};
/// # use mill_port::{ClientSocket, NetworkAddress, Transfer, error::Result};
/// # use std::sync::Arc;
/// # struct Hello;
/// # impl Context for Hello {
/// #     fn set_address(&mut self, _: NetworkAddress) {}
/// #     fn set_socket(&mut self, _: Arc<ClientSocket>) {}
/// #     fn process_transfer(&mut self) -> Result<Transfer> { Ok(Transfer::Complete) }
/// # }
///
/// let env = Environment::new();
/// let server = env.listen(
///     &Ip4Address::any(8080),
///     SocketKind::Stream,
///     Some(Arc::new(|| Box::new(Hello) as Box<dyn Context>)),
/// )?;
/// assert!(server.is_valid());
/// # Ok::<(), mill_port::error::NetworkError>(())
/// ```
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

impl Environment {
    /// Environment over the process-wide subsystem, logging through `tracing`.
    pub fn new() -> Self {
        EnvironmentBuilder::new().build()
    }

    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::new()
    }

    /// Whether the networking subsystem started successfully.
    pub fn is_valid(&self) -> bool {
        self.inner.subsystem.is_initialized()
    }

    /// Opens a server socket with the environment's default configuration.
    ///
    /// Fails only when `factory` is `None`. A socket that could not be
    /// initialized is still returned and registered; check
    /// [`is_valid`](Socket::is_valid) on it.
    pub fn listen(
        &self,
        address: &NetworkAddress,
        kind: SocketKind,
        factory: Option<Arc<dyn CallbackFactory>>,
    ) -> Result<Arc<ServerSocket>, NetworkError> {
        self.listen_with(address, kind, factory, self.inner.server_config.clone())
    }

    /// Like [`listen`](Self::listen) with an explicit configuration.
    pub fn listen_with(
        &self,
        address: &NetworkAddress,
        kind: SocketKind,
        factory: Option<Arc<dyn CallbackFactory>>,
        config: ServerConfig,
    ) -> Result<Arc<ServerSocket>, NetworkError> {
        let Some(factory) = factory else {
            let err = NetworkError::InvalidArgument("no callback factory supplied".into());
            self.inner
                .logger
                .log(LogLevel::Error, &format!("Cannot listen on {}, {}", address, err));
            return Err(err);
        };

        let server = ServerSocket::open(
            Arc::downgrade(&self.inner),
            *address,
            kind,
            factory,
            config,
            Arc::clone(&self.inner.logger),
        );
        self.inner
            .registry
            .insert(server.id().as_u64(), Entry::Server(Arc::clone(&server)));
        Ok(server)
    }

    /// Takes ownership of an already connected handle.
    pub fn attach_client_socket(
        &self,
        handle: ClientHandle,
        address: NetworkAddress,
        kind: SocketKind,
    ) -> Arc<ClientSocket> {
        self.inner.attach(handle, address, kind)
    }

    /// Removes `socket` from the registry and releases it. Sockets owned by
    /// another environment, or already closed, are left alone with a warning.
    pub fn close(&self, socket: &dyn Socket) {
        self.inner.close_id(socket.id());
    }

    pub fn owns(&self, socket: &dyn Socket) -> bool {
        self.inner.contains(socket.id())
    }

    /// Sockets currently registered.
    pub fn socket_count(&self) -> usize {
        self.inner.registry.iter().count()
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.inner.logger
    }

    pub fn subsystem(&self) -> &Arc<Subsystem> {
        &self.inner.subsystem
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.inner.close_all();
        self.inner.subsystem.release();
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("valid", &self.is_valid())
            .field("sockets", &self.socket_count())
            .finish()
    }
}

/// Builder for [`Environment`].
#[derive(Default)]
pub struct EnvironmentBuilder {
    logger: Option<Arc<dyn Logger>>,
    subsystem: Option<Arc<Subsystem>>,
    server_config: Option<ServerConfig>,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Use a private subsystem instead of the process-wide one
    pub fn subsystem(mut self, subsystem: Arc<Subsystem>) -> Self {
        self.subsystem = Some(subsystem);
        self
    }

    /// Defaults applied by [`Environment::listen`]
    pub fn server_config(mut self, config: ServerConfig) -> Self {
        self.server_config = Some(config);
        self
    }

    pub fn build(self) -> Environment {
        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger::default()));
        let subsystem = self.subsystem.unwrap_or_else(Subsystem::global);
        subsystem.acquire(logger.as_ref());

        let inner = Arc::new_cyclic(|me| EnvironmentInner {
            me: me.clone(),
            registry: Map::new(),
            subsystem,
            logger,
            server_config: self.server_config.unwrap_or_default(),
        });
        Environment { inner }
    }
}
