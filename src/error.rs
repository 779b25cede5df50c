use std::{error::Error, fmt, io, result::Result as StdResult};

use crate::socket::SocketId;

/// Result type returned by application callbacks.
pub type Result<T> = StdResult<T, Box<dyn Error + Send + Sync>>;

/// Failures reported by the networking core.
///
/// Construction-time failures of sockets are not returned through this type;
/// they degrade the socket to an invalid state observable through
/// [`Socket::is_valid`](crate::socket::Socket::is_valid). `NetworkError` is
/// used where an operation can refuse outright, and as the rendering of
/// conditions the core only logs.
#[derive(Debug)]
pub enum NetworkError {
    /// A required collaborator was missing or an argument was unusable.
    InvalidArgument(String),
    /// A handle, queue or thread could not be created.
    Resource(String),
    /// A bounded shutdown wait expired.
    Timeout(String),
    /// The socket does not belong to the environment asked to close it.
    NotOwned(SocketId),
    Io(io::Error),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            NetworkError::Resource(msg) => write!(f, "Resource error: {}", msg),
            NetworkError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            NetworkError::NotOwned(id) => {
                write!(f, "Socket {} is not owned by this environment", id)
            }
            NetworkError::Io(e) => write!(f, "IO Error: {}", e),
        }
    }
}

impl Error for NetworkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetworkError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_condition() {
        let err = NetworkError::InvalidArgument("no callback factory".into());
        assert_eq!(err.to_string(), "Invalid argument: no callback factory");

        let err = NetworkError::Timeout("workers did not exit".into());
        assert!(err.to_string().starts_with("Timeout"));
    }

    #[test]
    fn test_io_source_is_preserved() {
        let err = NetworkError::from(io::Error::from(io::ErrorKind::AddrInUse));
        let source = err.source().and_then(|e| e.downcast_ref::<io::Error>());
        assert_eq!(source.map(|e| e.kind()), Some(io::ErrorKind::AddrInUse));
    }
}
