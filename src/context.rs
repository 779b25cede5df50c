//! Per-connection continuations supplied by the application.
//!
//! A [`CallbackFactory`] produces one [`Context`] per accepted connection.
//! The listener thread binds the peer address and the connection to it and
//! posts it to the completion port; from then on whichever worker dequeues it
//! calls [`Context::process_transfer`]. The returned [`Transfer`] decides what
//! happens to the context next:
//!
//! - [`Transfer::Wait`] parks it until the connection reports the given
//!   readiness, then it is posted again
//! - [`Transfer::Requeue`] posts it again straight away
//! - [`Transfer::Complete`] drops it and closes the connection
//!
//! Only one worker holds a given context at a time, but consecutive calls may
//! run on different workers.
//!
//! ```rust
//! use mill_port::{ClientSocket, Context, NetworkAddress, Transfer};
//! use mill_port::error::Result;
//! use mio::Interest;
//! use std::{io, sync::Arc};
//!
//! #[derive(Default)]
//! struct Echo {
//!     socket: Option<Arc<ClientSocket>>,
//! }
//!
//! impl Context for Echo {
//!     fn set_address(&mut self, _address: NetworkAddress) {}
//!
//!     fn set_socket(&mut self, socket: Arc<ClientSocket>) {
//!         self.socket = Some(socket);
//!     }
//!
//!     fn process_transfer(&mut self) -> Result<Transfer> {
//!         let Some(socket) = &self.socket else {
//!             return Ok(Transfer::Complete);
//!         };
//!         let mut buf = [0u8; 1024];
//!         loop {
//!             match socket.read(&mut buf) {
//!                 Ok(0) => return Ok(Transfer::Complete),
//!                 Ok(n) => {
//!                     socket.write(&buf[..n])?;
//!                 }
//!                 Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
//!                     return Ok(Transfer::Wait(Interest::READABLE))
//!                 }
//!                 Err(e) => return Err(e.into()),
//!             }
//!         }
//!     }
//! }
//! ```

use std::sync::Arc;

use mio::Interest;

use crate::{address::NetworkAddress, error::Result, socket::ClientSocket};

/// What the core does with a context after `process_transfer` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Resume when the connection reports this readiness.
    Wait(Interest),
    /// Run again as soon as a worker is free.
    Requeue,
    /// Release the context and close the connection.
    Complete,
}

/// Continuation of the pending operation on one connection.
pub trait Context: Send + 'static {
    /// Called once by the listener thread, before the first transfer.
    fn set_address(&mut self, address: NetworkAddress);

    /// Called once by the listener thread, before the first transfer.
    fn set_socket(&mut self, socket: Arc<ClientSocket>);

    /// Performs the protocol's I/O for one completion.
    ///
    /// Runs on a worker thread. Returning an error has the same effect as
    /// [`Transfer::Complete`], after the error is logged.
    fn process_transfer(&mut self) -> Result<Transfer>;
}

/// Manufactures a context for every accepted connection.
///
/// Invoked on the listener thread, exactly once per connection.
pub trait CallbackFactory: Send + Sync + 'static {
    fn create_context(&self) -> Box<dyn Context>;
}

impl<F> CallbackFactory for F
where
    F: Fn() -> Box<dyn Context> + Send + Sync + 'static,
{
    fn create_context(&self) -> Box<dyn Context> {
        self()
    }
}
