//! Minimal HTTP responder served by a mill-port server socket.
//!
//! Run with `cargo run --example http_hello`, browse to http://127.0.0.1:8080/
//! and press enter (or close stdin) to shut down. Reading stdin stands in for
//! an interrupt handler: the environment is dropped as soon as a line or EOF
//! arrives, which closes the server and every connection.

use anyhow::{bail, Context as _};
use mill_port::{
    error::Result, ClientSocket, Context, Environment, Interest, Ip4Address, NetworkAddress,
    Socket, SocketKind, Transfer,
};
use std::{io, sync::Arc};
use tracing::info;

const CONTENT: &str =
    "<html><title>Hello, World!</title><body><h1>Hello, socket world!</h1></body></html>";

fn response(request: &[u8]) -> Vec<u8> {
    let (status, body) = if request.starts_with(b"GET / HTTP") {
        ("200 OK", CONTENT)
    } else {
        ("404 Not Found", "<h1>404 Not Found</h1>")
    };
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

/// One request, one response, then the connection is closed.
#[derive(Default)]
struct HelloContext {
    socket: Option<Arc<ClientSocket>>,
    peer: Option<NetworkAddress>,
    request: Vec<u8>,
    reply: Option<(Vec<u8>, usize)>,
}

impl HelloContext {
    fn read_request(&mut self, socket: &ClientSocket) -> Result<Option<Transfer>> {
        let mut buf = [0u8; 2048];
        loop {
            match socket.read(&mut buf) {
                Ok(0) => return Ok(Some(Transfer::Complete)),
                Ok(n) => {
                    self.request.extend_from_slice(&buf[..n]);
                    if self.request.windows(4).any(|w| w == b"\r\n\r\n") {
                        self.reply = Some((response(&self.request), 0));
                        return Ok(None);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Some(Transfer::Wait(Interest::READABLE)))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_reply(&mut self, socket: &ClientSocket) -> Result<Transfer> {
        let Some((bytes, sent)) = &mut self.reply else {
            return Ok(Transfer::Complete);
        };
        while *sent < bytes.len() {
            match socket.write(&bytes[*sent..]) {
                Ok(n) => *sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Transfer::Wait(Interest::WRITABLE))
                }
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(peer) = &self.peer {
            info!("answered {}", peer);
        }
        Ok(Transfer::Complete)
    }
}

impl Context for HelloContext {
    fn set_address(&mut self, address: NetworkAddress) {
        self.peer = Some(address);
    }

    fn set_socket(&mut self, socket: Arc<ClientSocket>) {
        self.socket = Some(socket);
    }

    fn process_transfer(&mut self) -> Result<Transfer> {
        let Some(socket) = self.socket.clone() else {
            return Ok(Transfer::Complete);
        };
        if self.reply.is_none() {
            if let Some(transfer) = self.read_request(&socket)? {
                return Ok(transfer);
            }
        }
        self.write_reply(&socket)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let env = Environment::new();
    let server = env
        .listen(
            &Ip4Address::any(8080),
            SocketKind::Stream,
            Some(Arc::new(|| Box::new(HelloContext::default()) as Box<dyn Context>)),
        )
        .context("listen")?;

    if !server.is_valid() {
        bail!("Can't start network listener: {}", server.last_error());
    }
    let addr = server
        .local_address()
        .and_then(|address| address.to_socket_addr())
        .context("listener has no local address")?;
    info!(
        "Serving http://{} with {} workers, press enter to stop",
        addr,
        server.worker_count()
    );

    let mut line = String::new();
    io::stdin().read_line(&mut line).context("reading stdin")?;

    drop(env);
    Ok(())
}
