//! Socket ownership hierarchy.
//!
//! Every socket is created by an [`Environment`](crate::Environment), which
//! keeps it in its registry until [`Environment::close`] or the environment
//! itself is dropped. Applications hold `Arc` handles; releasing the OS
//! resource only ever happens through the owner, and it is idempotent.
//!
//! [`Environment::close`]: crate::Environment::close

mod client;
pub mod config;
mod server;

pub use client::{ClientHandle, ClientSocket};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use server::{ServerSocket, ServerState};

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, Weak,
    },
};

use socket2::{Protocol, Type};

use crate::{address::NetworkAddress, environment::EnvironmentInner};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    pub(crate) fn next() -> Self {
        SocketId(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(id: u64) -> Self {
        SocketId(id)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport kind of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl SocketKind {
    pub(crate) fn socket_type(self) -> Type {
        match self {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Datagram => Type::DGRAM,
        }
    }

    pub(crate) fn protocol(self) -> Protocol {
        match self {
            SocketKind::Stream => Protocol::TCP,
            SocketKind::Datagram => Protocol::UDP,
        }
    }
}

/// Outcome of the last operation that changed a socket's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastError {
    /// The last operation succeeded.
    Success,
    /// The socket holds no OS handle.
    NotSocket,
    Io {
        kind: io::ErrorKind,
        code: Option<i32>,
    },
    /// No worker thread could be started.
    Fault,
}

impl From<&io::Error> for LastError {
    fn from(err: &io::Error) -> Self {
        LastError::Io {
            kind: err.kind(),
            code: err.raw_os_error(),
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LastError::Success => f.write_str("success"),
            LastError::NotSocket => f.write_str("not a socket"),
            LastError::Io {
                kind,
                code: Some(code),
            } => write!(f, "{} (os error {})", kind, code),
            LastError::Io { kind, code: None } => write!(f, "{}", kind),
            LastError::Fault => f.write_str("fault"),
        }
    }
}

/// Behaviour shared by client and server sockets.
pub trait Socket: Send + Sync {
    fn id(&self) -> SocketId;

    fn kind(&self) -> SocketKind;

    /// Address the socket was bound to, or the peer for accepted connections.
    fn address(&self) -> NetworkAddress;

    fn last_error(&self) -> LastError;

    /// Whether the socket is open and ready to transfer.
    fn is_valid(&self) -> bool;

    /// Closes the socket through the environment that owns it.
    fn close(&self);
}

/// State common to every socket.
pub(crate) struct SocketCore {
    id: SocketId,
    owner: Weak<EnvironmentInner>,
    address: NetworkAddress,
    kind: SocketKind,
    last_error: Mutex<LastError>,
}

impl SocketCore {
    pub fn new(owner: Weak<EnvironmentInner>, address: NetworkAddress, kind: SocketKind) -> Self {
        Self {
            id: SocketId::next(),
            owner,
            address,
            kind,
            last_error: Mutex::new(LastError::NotSocket),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    pub fn address(&self) -> NetworkAddress {
        self.address
    }

    pub fn owner(&self) -> Weak<EnvironmentInner> {
        self.owner.clone()
    }

    pub fn last_error(&self) -> LastError {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_last_error(&self, error: LastError) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    /// Hands the socket back to its owner. Sockets whose environment is gone
    /// were already released by its teardown.
    pub fn close(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.close_id(self.id);
        }
    }

    /// Unregisters the socket without reporting it when it is already gone.
    pub fn discard(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.discard(self.id);
        }
    }
}
