//! # Mill-Port
//! Completion-queue driven server sockets for Rust, built on [`mio`] without an async runtime.
//!
//! A server socket owns one listener thread and a fixed pool of worker threads. The listener
//! accepts connections, asks the application's [`CallbackFactory`] for a [`Context`] per
//! connection and posts it to a shared completion port. Workers dequeue completions and run
//! [`Context::process_transfer`], whose [`Transfer`] result parks the context until its
//! connection is ready again, requeues it, or completes it.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │ Environment │───▶│ ServerSocket │───▶│ Listener thread  │
//! └─────────────┘    └──────────────┘    └──────────────────┘
//!        │                   │                     │ accept / readiness
//!        ▼                   ▼                     ▼
//! ┌─────────────┐    ┌──────────────┐    ┌──────────────────┐
//! │  Registry   │    │   Workers    │◀───│ Completion port  │
//! └─────────────┘    └──────────────┘    └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_port::prelude::*;
//! use mill_port::error::Result;
//! use std::{io, sync::Arc};
//!
//! #[derive(Default)]
//! struct Hello {
//!     socket: Option<Arc<ClientSocket>>,
//! }
//!
//! impl Context for Hello {
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
//!         match socket.write(b"hello\n") {
//!             Ok(_) => Ok(Transfer::Complete),
//!             Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
//!                 Ok(Transfer::Wait(Interest::WRITABLE))
//!             }
//!             Err(e) => Err(e.into()),
//!         }
//!     }
//! }
//!
//! fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let env = Environment::new();
//!     let server = env.listen(
//!         &Ip4Address::any(7070),
//!         SocketKind::Stream,
//!         Some(Arc::new(|| Box::new(Hello::default()) as Box<dyn Context>)),
//!     )?;
//!     if !server.is_valid() {
//!         return Err(format!("listen failed: {}", server.last_error()).into());
//!     }
//!     // serve until the environment is dropped
//!     std::thread::park();
//!     Ok(())
//! }
//! ```
//!
//! - [`Environment`]: subsystem guard and owner of every socket
//! - [`socket`]: client and server sockets, configuration
//! - [`context`]: the continuation protocol between the core and the application
//! - [`trace`]: the logging seam
//! - [`error`]: error types and result handling

pub mod address;
mod completion;
pub mod context;
pub mod environment;
pub mod error;
pub mod socket;
pub mod subsystem;
pub mod trace;
pub mod utils;
pub mod worker;

pub use address::{AddressFamily, Ip4Address, NetworkAddress};
pub use context::{CallbackFactory, Context, Transfer};
pub use environment::{Environment, EnvironmentBuilder};
pub use error::NetworkError;
pub use mio::Interest;
pub use socket::{
    ClientHandle, ClientSocket, LastError, ServerConfig, ServerSocket, ServerState, Socket,
    SocketId, SocketKind,
};
pub use subsystem::Subsystem;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_port::prelude::*;
/// ```
pub mod prelude {
    pub use crate::address::{Ip4Address, NetworkAddress};
    pub use crate::context::{CallbackFactory, Context, Transfer};
    pub use crate::environment::Environment;
    pub use crate::socket::{ClientSocket, ServerConfig, ServerSocket, Socket, SocketKind};
    pub use crate::trace::{LogLevel, Logger};
    pub use mio::Interest;
}
