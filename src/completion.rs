//! Completion port shared by a server socket's listener and workers.
//!
//! The port combines two things:
//!
//! - a ready queue, a blocking multi-producer/multi-consumer channel that
//!   workers dequeue from. Entries are either an [`Operation`] whose
//!   context is ready to run, or a shutdown sentinel.
//! - a readiness registry. Connections are registered with the port's mio
//!   poller; a context that returns [`Transfer::Wait`] is parked under its
//!   connection token until the listener thread sees readiness for it and
//!   posts it back to the ready queue.
//!
//! ```text
//!   listener thread                     worker threads
//!   ┌──────────────┐   post(Ready)    ┌───────────────┐
//!   │ accept       │ ───────────────▶ │ dequeue       │
//!   │ poll(mio)    │                  │ process_      │
//!   │  readiness ──┼── wake_ready ──▶ │   transfer    │
//!   └──────────────┘        ▲         └──────┬────────┘
//!                           │  park(Wait)    │
//!                           └────────────────┘
//! ```
//!
//! [`Transfer::Wait`]: crate::context::Transfer::Wait

use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use mio::{Interest, Poll, Registry, Token, Waker};

use crate::{
    context::Context,
    socket::{ClientSocket, Socket, SocketId, SocketKind},
    trace::{LogLevel, Logger},
};

/// Token of the listening socket.
pub(crate) const LISTENER_TOKEN: Token = Token(0);
/// Token of the waker used to interrupt the listener's poll.
pub(crate) const WAKE_TOKEN: Token = Token(1);
const RESERVED_TOKENS: usize = 2;

/// Token under which a connection is registered.
pub(crate) fn connection_token(id: SocketId) -> Token {
    Token(RESERVED_TOKENS + id.as_u64() as usize)
}

/// A context together with the connection it serves.
pub(crate) struct Operation {
    pub context: Box<dyn Context>,
    pub socket: Arc<ClientSocket>,
}

pub(crate) enum Completion {
    Ready(Operation),
    /// Sentinel telling one worker to exit.
    Shutdown,
}

struct QueueState {
    items: VecDeque<Completion>,
    closed: bool,
}

/// Blocking FIFO shared by any number of producers and consumers.
struct CompletionQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl CompletionQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands the completion back when the queue is closed.
    fn push(&self, completion: Completion) -> Result<(), Completion> {
        let mut state = self.lock();
        if state.closed {
            return Err(completion);
        }
        state.items.push_back(completion);
        self.condvar.notify_one();
        Ok(())
    }

    /// Blocks until a completion is available. A closed, drained queue
    /// yields the shutdown sentinel.
    fn pop(&self) -> Completion {
        let mut state = self.lock();
        loop {
            if let Some(completion) = state.items.pop_front() {
                return completion;
            }
            if state.closed {
                return Completion::Shutdown;
            }
            state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn len(&self) -> usize {
        self.lock().items.len()
    }

    fn close(&self) -> Vec<Completion> {
        let mut state = self.lock();
        state.closed = true;
        self.condvar.notify_all();
        state.items.drain(..).collect()
    }
}

pub(crate) struct CompletionPort {
    queue: CompletionQueue,
    concurrency: usize,
    registry: Registry,
    waker: Waker,
    poll: Mutex<Option<Poll>>,
    parked: Mutex<HashMap<Token, Operation>>,
    logger: Arc<dyn Logger>,
}

impl CompletionPort {
    /// Creates a port meant to be drained by `concurrency` workers.
    pub fn new(concurrency: usize, logger: Arc<dyn Logger>) -> io::Result<Self> {
        if concurrency == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "completion port needs a non-zero concurrency",
            ));
        }

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            queue: CompletionQueue::new(),
            concurrency,
            registry,
            waker,
            poll: Mutex::new(Some(poll)),
            parked: Mutex::new(HashMap::new()),
            logger,
        })
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Hands the poller to the thread that will drive readiness.
    pub fn take_poll(&self) -> Option<Poll> {
        self.poll.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            self.logger
                .log(LogLevel::Error, &format!("Failed to wake listener: {}", e));
        }
    }

    /// Registers a connection so readiness on it can be re-armed later.
    pub fn associate(&self, socket: &ClientSocket) -> io::Result<()> {
        socket.register(&self.registry, socket.token(), Interest::READABLE)
    }

    /// Queues a completion. Operations posted to a closed port are released.
    pub fn post(&self, completion: Completion) {
        if let Err(Completion::Ready(op)) = self.queue.push(completion) {
            self.release(op);
        }
    }

    pub fn dequeue(&self) -> Completion {
        self.queue.pop()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Parks an operation until its connection reports `interest`.
    pub fn park(&self, op: Operation, interest: Interest) {
        let token = op.socket.token();
        let socket = Arc::clone(&op.socket);

        let failed = {
            let mut parked = self.parked.lock().unwrap_or_else(|e| e.into_inner());
            if self.queue.lock().closed {
                Some(op)
            } else {
                parked.insert(token, op);
                match socket.rearm(&self.registry, token, interest) {
                    Ok(()) => None,
                    Err(e) => {
                        self.logger.log(
                            LogLevel::Debug,
                            &format!("Cannot re-arm socket {}: {}", socket.id(), e),
                        );
                        parked.remove(&token)
                    }
                }
            }
        };

        if let Some(op) = failed {
            self.release(op);
        }
    }

    /// Moves the operation parked under `token` back to the ready queue.
    /// Readiness for a connection whose context is running is ignored; the
    /// context re-arms when it parks again.
    pub fn wake_ready(&self, token: Token) {
        let op = self
            .parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&token);
        if let Some(op) = op {
            self.post(Completion::Ready(op));
        }
    }

    /// Drops a finished operation and closes its connection.
    ///
    /// Releasing a datagram socket wakes the listener, which serves the
    /// bound endpoint with a fresh context.
    pub fn release(&self, op: Operation) {
        let Operation { context, socket } = op;
        drop(context);
        socket.deregister(&self.registry);
        self.logger.log(
            LogLevel::Debug,
            &format!("Released context of socket {}", socket.id()),
        );
        socket.release();
        if socket.kind() == SocketKind::Datagram {
            self.wake();
        }
    }

    /// Closes the ready queue and releases every queued or parked operation.
    pub fn close(&self) {
        let queued = self.queue.close();
        let parked: Vec<Operation> = self
            .parked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, op)| op)
            .collect();

        for completion in queued {
            if let Completion::Ready(op) = completion {
                self.release(op);
            }
        }
        for op in parked {
            self.release(op);
        }
    }
}
