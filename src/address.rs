//! Family-tagged network addresses in the OS native layout.
//!
//! A [`NetworkAddress`] is a fixed-capacity byte buffer holding a native
//! socket address record, so it can be handed straight to bind, accept or
//! connect calls. It is built through [`socket2::SockAddr`], which owns the
//! platform specific layout.

use std::{
    fmt, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    ops::Deref,
    ptr, slice,
};

use socket2::{Domain, SockAddr};

/// Bytes reserved for one address. Matches the size of the OS
/// `sockaddr_storage`, which fits every supported family.
pub const ADDRESS_CAPACITY: usize = 128;

/// Address family of a [`NetworkAddress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// Placeholder family of a default constructed address.
    Unspecified,
    Ipv4,
    Ipv6,
    Unix,
}

/// Address of an endpoint in a network.
///
/// After construction the buffer always holds a structurally valid record
/// for its family. `NetworkAddress::default()` is a zeroed, family-less
/// placeholder whose whole capacity is available to be filled by an accept
/// call through [`as_bytes_mut`](Self::as_bytes_mut).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkAddress {
    bytes: [u8; ADDRESS_CAPACITY],
    len: usize,
}

impl NetworkAddress {
    /// Copies the native record out of a `socket2` address.
    pub fn from_sockaddr(addr: &SockAddr) -> Self {
        let len = (addr.len() as usize).min(ADDRESS_CAPACITY);
        let mut bytes = [0u8; ADDRESS_CAPACITY];
        // SAFETY: `as_ptr` points to a storage of at least `addr.len()` bytes.
        let raw = unsafe { slice::from_raw_parts(addr.as_ptr().cast::<u8>(), len) };
        bytes[..len].copy_from_slice(raw);
        Self { bytes, len }
    }

    /// Native address for passing to OS socket calls.
    pub fn to_sockaddr(&self) -> io::Result<SockAddr> {
        let bytes = self.bytes;
        let len = self.len;
        // SAFETY: at most `size_of_val(storage)` bytes are written and the
        // reported length matches what was copied.
        let ((), addr) = unsafe {
            SockAddr::try_init(|storage, socklen| {
                let len = len.min(std::mem::size_of_val(&*storage));
                ptr::copy_nonoverlapping(bytes.as_ptr(), storage.cast::<u8>(), len);
                *socklen = len as _;
                Ok(())
            })?
        };
        Ok(addr)
    }

    /// IP socket address, if this is an IPv4 or IPv6 record.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.to_sockaddr().ok().and_then(|addr| addr.as_socket())
    }

    pub fn family(&self) -> AddressFamily {
        let Ok(addr) = self.to_sockaddr() else {
            return AddressFamily::Unspecified;
        };
        let domain = addr.domain();
        if domain == Domain::IPV4 {
            return AddressFamily::Ipv4;
        }
        if domain == Domain::IPV6 {
            return AddressFamily::Ipv6;
        }
        #[cfg(unix)]
        if domain == Domain::UNIX {
            return AddressFamily::Unix;
        }
        AddressFamily::Unspecified
    }

    /// Port of an IP address, `None` for other families.
    pub fn port(&self) -> Option<u16> {
        self.to_socket_addr().map(|addr| addr.port())
    }

    /// Native bytes of the stored record.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Whole buffer, for OS calls that fill an address in place.
    ///
    /// Call [`set_length`](Self::set_length) afterwards with the length the
    /// OS reported.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..]
    }

    pub fn set_length(&mut self, len: usize) {
        self.len = len.min(ADDRESS_CAPACITY);
    }

    /// Length in bytes of the stored record.
    pub fn length(&self) -> usize {
        self.len
    }
}

impl Default for NetworkAddress {
    fn default() -> Self {
        Self {
            bytes: [0u8; ADDRESS_CAPACITY],
            len: ADDRESS_CAPACITY,
        }
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::from_sockaddr(&SockAddr::from(addr))
    }
}

impl From<&SockAddr> for NetworkAddress {
    fn from(addr: &SockAddr) -> Self {
        Self::from_sockaddr(addr)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{}", addr.ip()),
            None if self.family() == AddressFamily::Unix => f.write_str("<unix>"),
            None => f.write_str("<unspecified>"),
        }
    }
}

impl fmt::Debug for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "NetworkAddress({})", addr),
            None => write!(f, "NetworkAddress({:?}, {} bytes)", self.family(), self.len),
        }
    }
}

/// IPv4 address built from a host-order address and a port.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ip4Address(NetworkAddress);

impl Ip4Address {
    pub fn new(addr: u32, port: u16) -> Self {
        let v4 = SocketAddrV4::new(Ipv4Addr::from(addr), port);
        Ip4Address(NetworkAddress::from(SocketAddr::V4(v4)))
    }

    /// `0.0.0.0:port`
    pub fn any(port: u16) -> Self {
        Self::new(u32::from(Ipv4Addr::UNSPECIFIED), port)
    }

    /// `127.0.0.1:port`
    pub fn loopback(port: u16) -> Self {
        Self::new(u32::from(Ipv4Addr::LOCALHOST), port)
    }
}

impl Deref for Ip4Address {
    type Target = NetworkAddress;

    fn deref(&self) -> &NetworkAddress {
        &self.0
    }
}

impl From<Ip4Address> for NetworkAddress {
    fn from(addr: Ip4Address) -> Self {
        addr.0
    }
}

impl fmt::Display for Ip4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Ip4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}
