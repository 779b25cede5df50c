#![allow(dead_code)]

use mill_port::{
    error::Result,
    subsystem::NetworkStack,
    trace::{LogLevel, Logger},
    worker::{OsThreads, ThreadBody, ThreadSpawner},
    ClientSocket, Context, Interest, NetworkAddress, Transfer,
};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Keeps every message for later inspection.
#[derive(Default)]
pub struct CaptureLogger {
    messages: Mutex<Vec<(LogLevel, String)>>,
}

impl CaptureLogger {
    pub fn count(&self, level: LogLevel) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl Logger for CaptureLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((level, message.to_string()));
    }
}

#[derive(Default)]
struct StackCounters {
    startups: AtomicUsize,
    cleanups: AtomicUsize,
    fail: AtomicBool,
}

/// Network stack that only counts start-ups and clean-ups. Clones share the
/// counters.
#[derive(Clone, Default)]
pub struct CountingStack(Arc<StackCounters>);

impl CountingStack {
    pub fn failing() -> Self {
        let stack = Self::default();
        stack.0.fail.store(true, Ordering::SeqCst);
        stack
    }

    pub fn startups(&self) -> usize {
        self.0.startups.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.0.cleanups.load(Ordering::SeqCst)
    }
}

impl NetworkStack for CountingStack {
    fn startup(&self) -> io::Result<()> {
        self.0.startups.fetch_add(1, Ordering::SeqCst);
        if self.0.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "stack disabled"));
        }
        Ok(())
    }

    fn cleanup(&self) {
        self.0.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Spawner that refuses worker threads after `allowed` of them started.
/// The listener thread is always started.
pub struct WorkerLimit {
    allowed: usize,
    spawned: AtomicUsize,
}

impl WorkerLimit {
    pub fn new(allowed: usize) -> Self {
        Self {
            allowed,
            spawned: AtomicUsize::new(0),
        }
    }
}

impl ThreadSpawner for WorkerLimit {
    fn spawn(&self, name: String, body: ThreadBody) -> io::Result<JoinHandle<()>> {
        if name.starts_with("mill-port-worker")
            && self.spawned.fetch_add(1, Ordering::SeqCst) >= self.allowed
        {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "no threads left"));
        }
        OsThreads.spawn(name, body)
    }
}

/// Counters shared by the contexts of one test.
#[derive(Default)]
pub struct Stats {
    pub created: AtomicUsize,
    pub transfers: AtomicUsize,
    pub dropped: AtomicUsize,
    pub bytes: AtomicUsize,
}

/// Echoes everything it reads until the peer closes.
pub struct Echo {
    stats: Arc<Stats>,
    socket: Option<Arc<ClientSocket>>,
    pub address: Option<NetworkAddress>,
}

impl Echo {
    pub fn factory(stats: Arc<Stats>) -> Arc<dyn mill_port::CallbackFactory> {
        Arc::new(move || {
            stats.created.fetch_add(1, Ordering::SeqCst);
            Box::new(Echo {
                stats: Arc::clone(&stats),
                socket: None,
                address: None,
            }) as Box<dyn Context>
        })
    }
}

impl Context for Echo {
    fn set_address(&mut self, address: NetworkAddress) {
        self.address = Some(address);
    }

    fn set_socket(&mut self, socket: Arc<ClientSocket>) {
        self.socket = Some(socket);
    }

    fn process_transfer(&mut self) -> Result<Transfer> {
        self.stats.transfers.fetch_add(1, Ordering::SeqCst);
        let Some(socket) = &self.socket else {
            return Ok(Transfer::Complete);
        };

        let mut buf = [0u8; 4096];
        loop {
            match socket.read(&mut buf) {
                Ok(0) => return Ok(Transfer::Complete),
                Ok(n) => {
                    self.stats.bytes.fetch_add(n, Ordering::SeqCst);
                    let mut written = 0;
                    while written < n {
                        match socket.write(&buf[written..n]) {
                            Ok(m) => written += m,
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                thread::yield_now()
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Transfer::Wait(Interest::READABLE))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for Echo {
    fn drop(&mut self) {
        self.stats.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Blocks inside its first transfer until `release` is set.
pub struct Hang {
    pub entered: Arc<AtomicBool>,
    pub release: Arc<AtomicBool>,
}

impl Context for Hang {
    fn set_address(&mut self, _address: NetworkAddress) {}

    fn set_socket(&mut self, _socket: Arc<ClientSocket>) {}

    fn process_transfer(&mut self) -> Result<Transfer> {
        self.entered.store(true, Ordering::SeqCst);
        while !self.release.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(Transfer::Complete)
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
