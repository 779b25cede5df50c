use std::{
    fmt,
    io::{self, Read, Write},
    net::Shutdown,
    sync::{Mutex, MutexGuard, Weak},
};

use mio::{
    event::Source,
    net::{TcpStream, UdpSocket},
    Interest, Registry, Token,
};

use super::{LastError, Socket, SocketCore, SocketId, SocketKind};
use crate::{address::NetworkAddress, completion::connection_token, environment::EnvironmentInner};

/// OS handle of an established connection.
pub enum ClientHandle {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

impl ClientHandle {
    /// Wraps a connected `socket2` handle, switching it to non-blocking mode.
    pub fn from_socket(socket: socket2::Socket, kind: SocketKind) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(match kind {
            SocketKind::Stream => {
                ClientHandle::Stream(TcpStream::from_std(std::net::TcpStream::from(socket)))
            }
            SocketKind::Datagram => {
                ClientHandle::Datagram(UdpSocket::from_std(std::net::UdpSocket::from(socket)))
            }
        })
    }

    pub fn kind(&self) -> SocketKind {
        match self {
            ClientHandle::Stream(_) => SocketKind::Stream,
            ClientHandle::Datagram(_) => SocketKind::Datagram,
        }
    }

    fn source(&mut self) -> &mut dyn Source {
        match self {
            ClientHandle::Stream(stream) => stream,
            ClientHandle::Datagram(socket) => socket,
        }
    }
}

impl From<TcpStream> for ClientHandle {
    fn from(stream: TcpStream) -> Self {
        ClientHandle::Stream(stream)
    }
}

impl From<UdpSocket> for ClientHandle {
    fn from(socket: UdpSocket) -> Self {
        ClientHandle::Datagram(socket)
    }
}

impl TryFrom<std::net::TcpStream> for ClientHandle {
    type Error = io::Error;

    fn try_from(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(ClientHandle::Stream(TcpStream::from_std(stream)))
    }
}

impl TryFrom<std::net::UdpSocket> for ClientHandle {
    type Error = io::Error;

    fn try_from(socket: std::net::UdpSocket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(ClientHandle::Datagram(UdpSocket::from_std(socket)))
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientHandle::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
            ClientHandle::Datagram(socket) => f.debug_tuple("Datagram").field(socket).finish(),
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}

/// One established connection.
///
/// All I/O is non-blocking: reads and writes that cannot make progress fail
/// with [`io::ErrorKind::WouldBlock`], after which a context returns
/// [`Transfer::Wait`](crate::Transfer::Wait) to be resumed on readiness.
/// Calls on a closed socket fail with [`io::ErrorKind::NotConnected`].
pub struct ClientSocket {
    core: SocketCore,
    handle: Mutex<Option<ClientHandle>>,
}

impl ClientSocket {
    pub(crate) fn new(
        owner: Weak<EnvironmentInner>,
        handle: ClientHandle,
        address: NetworkAddress,
        kind: SocketKind,
    ) -> Self {
        let core = SocketCore::new(owner, address, kind);
        core.set_last_error(LastError::Success);
        Self {
            core,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ClientHandle>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_handle<T>(&self, f: impl FnOnce(&mut ClientHandle) -> io::Result<T>) -> io::Result<T> {
        match self.lock().as_mut() {
            Some(handle) => f(handle),
            None => Err(not_connected()),
        }
    }

    /// Poll token the connection is registered under.
    pub fn token(&self) -> Token {
        connection_token(self.core.id())
    }

    /// Address of the remote endpoint.
    pub fn peer_address(&self) -> NetworkAddress {
        self.core.address()
    }

    pub fn local_address(&self) -> io::Result<NetworkAddress> {
        self.with_handle(|handle| match handle {
            ClientHandle::Stream(stream) => stream.local_addr().map(NetworkAddress::from),
            ClientHandle::Datagram(socket) => socket.local_addr().map(NetworkAddress::from),
        })
    }

    /// Reads from a stream, or receives one datagram.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_handle(|handle| match handle {
            ClientHandle::Stream(stream) => stream.read(buf),
            ClientHandle::Datagram(socket) => socket.recv_from(buf).map(|(n, _)| n),
        })
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.with_handle(|handle| match handle {
            ClientHandle::Stream(stream) => stream.write(buf),
            ClientHandle::Datagram(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram sockets need a destination, use send_to",
            )),
        })
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, NetworkAddress)> {
        self.with_handle(|handle| match handle {
            ClientHandle::Datagram(socket) => socket
                .recv_from(buf)
                .map(|(n, from)| (n, NetworkAddress::from(from))),
            ClientHandle::Stream(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recv_from on a stream socket",
            )),
        })
    }

    pub fn send_to(&self, buf: &[u8], target: &NetworkAddress) -> io::Result<usize> {
        let target = target.to_socket_addr().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target is not an IP address")
        })?;
        self.with_handle(|handle| match handle {
            ClientHandle::Datagram(socket) => socket.send_to(buf, target),
            ClientHandle::Stream(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "send_to on a stream socket",
            )),
        })
    }

    pub(crate) fn register(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        self.with_handle(|handle| registry.register(handle.source(), token, interest))
    }

    pub(crate) fn rearm(&self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        self.with_handle(|handle| registry.reregister(handle.source(), token, interest))
    }

    pub(crate) fn deregister(&self, registry: &Registry) {
        let _ = self.with_handle(|handle| registry.deregister(handle.source()));
    }

    /// Half-closes both directions and releases the handle. Safe to call any
    /// number of times.
    pub(crate) fn shutdown(&self) {
        if let Some(handle) = self.lock().take() {
            if let ClientHandle::Stream(stream) = &handle {
                let _ = stream.shutdown(Shutdown::Both);
            }
            drop(handle);
        }
        self.core.set_last_error(LastError::NotSocket);
    }

    /// Closes the connection on behalf of the core. A connection the
    /// application already closed is released silently.
    pub(crate) fn release(&self) {
        self.core.discard();
        self.shutdown();
    }
}

impl Socket for ClientSocket {
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
        self.lock().is_some()
    }

    fn close(&self) {
        self.core.close();
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocket")
            .field("id", &self.core.id())
            .field("kind", &self.core.kind())
            .field("peer", &self.core.address())
            .field("valid", &self.is_valid())
            .finish()
    }
}
