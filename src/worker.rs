//! Worker threads draining a completion port.
//!
//! Threads are started through a [`ThreadSpawner`] and grouped in a
//! [`ThreadGroup`] whose members count down a shared exit latch when they
//! finish, so shutdown can wait for them with a deadline instead of joining
//! blindly.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{Builder, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    completion::{Completion, CompletionPort, Operation},
    context::Transfer,
    socket::Socket,
    trace::{LogLevel, Logger},
};

pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Starts OS threads on behalf of server sockets.
pub trait ThreadSpawner: Send + Sync {
    fn spawn(&self, name: String, body: ThreadBody) -> io::Result<JoinHandle<()>>;
}

/// Spawns named threads with [`std::thread::Builder`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OsThreads;

impl ThreadSpawner for OsThreads {
    fn spawn(&self, name: String, body: ThreadBody) -> io::Result<JoinHandle<()>> {
        Builder::new().name(name).spawn(body)
    }
}

struct ExitLatch {
    running: Mutex<usize>,
    condvar: Condvar,
}

impl ExitLatch {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn leave(&self) {
        let mut running = self.lock();
        *running = running.saturating_sub(1);
        self.condvar.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut running = self.lock();
        while *running > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            running = match self.condvar.wait_timeout(running, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        true
    }
}

/// Counts a thread down on the latch when dropped, including when the thread
/// never ran because spawning failed.
struct ExitGuard(Arc<ExitLatch>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// Threads that are waited for together.
pub(crate) struct ThreadGroup {
    threads: Vec<JoinHandle<()>>,
    latch: Arc<ExitLatch>,
}

impl Default for ThreadGroup {
    fn default() -> Self {
        Self {
            threads: Vec::new(),
            latch: Arc::new(ExitLatch {
                running: Mutex::new(0),
                condvar: Condvar::new(),
            }),
        }
    }
}

impl ThreadGroup {
    pub fn spawn<F>(&mut self, spawner: &dyn ThreadSpawner, name: String, body: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        *self.latch.lock() += 1;
        let guard = ExitGuard(Arc::clone(&self.latch));
        let thread = spawner.spawn(
            name,
            Box::new(move || {
                let _guard = guard;
                body();
            }),
        )?;
        self.threads.push(thread);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Waits for every member to exit. Returns false when `timeout` expired.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.latch.wait(timeout)
    }

    /// Joins members that finished and abandons the rest.
    pub fn release(&mut self) {
        for thread in self.threads.drain(..) {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
    }
}

/// Body of one worker thread.
///
/// Blocks on the port until a completion arrives. A shutdown sentinel ends
/// the loop; a ready operation is handed to its context.
pub(crate) fn run_worker(id: usize, port: Arc<CompletionPort>, logger: Arc<dyn Logger>) {
    loop {
        match port.dequeue() {
            Completion::Shutdown => break,
            Completion::Ready(op) => dispatch(op, &port, logger.as_ref()),
        }
    }
    logger.log(LogLevel::Debug, &format!("Worker {} exiting", id));
}

fn dispatch(mut op: Operation, port: &CompletionPort, logger: &dyn Logger) {
    let socket_id = op.socket.id();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| op.context.process_transfer()));

    let transfer = match outcome {
        Ok(Ok(transfer)) => transfer,
        Ok(Err(e)) => {
            logger.log(
                LogLevel::Error,
                &format!("Transfer on socket {} failed: {}", socket_id, e),
            );
            Transfer::Complete
        }
        Err(_) => {
            logger.log(
                LogLevel::Error,
                &format!("Transfer on socket {} panicked", socket_id),
            );
            Transfer::Complete
        }
    };

    match transfer {
        Transfer::Wait(interest) => port.park(op, interest),
        Transfer::Requeue => port.post(Completion::Ready(op)),
        Transfer::Complete => port.release(op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailAfter {
        allowed: usize,
        spawned: AtomicUsize,
    }

    impl ThreadSpawner for FailAfter {
        fn spawn(&self, name: String, body: ThreadBody) -> io::Result<JoinHandle<()>> {
            if self.spawned.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(io::Error::new(io::ErrorKind::OutOfMemory, "no threads left"));
            }
            OsThreads.spawn(name, body)
        }
    }

    #[test]
    fn test_group_waits_for_members() {
        let mut group = ThreadGroup::default();
        let counter = Arc::new(AtomicUsize::new(0));

        for id in 0..3 {
            let counter = counter.clone();
            group
                .spawn(&OsThreads, format!("test-{id}"), move || {
                    std::thread::sleep(Duration::from_millis(20));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert_eq!(group.len(), 3);
        assert!(group.wait(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        group.release();
        assert!(group.is_empty());
    }

    #[test]
    fn test_wait_times_out_on_stuck_member() {
        let mut group = ThreadGroup::default();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        group
            .spawn(&OsThreads, "stuck".into(), move || {
                let _ = rx.recv();
            })
            .unwrap();

        assert!(!group.wait(Duration::from_millis(50)));
        group.release();
        assert!(group.is_empty());
        drop(tx);
    }

    #[test]
    fn test_failed_spawn_does_not_count() {
        let spawner = FailAfter {
            allowed: 1,
            spawned: AtomicUsize::new(0),
        };
        let mut group = ThreadGroup::default();

        assert!(group.spawn(&spawner, "a".into(), || {}).is_ok());
        assert!(group.spawn(&spawner, "b".into(), || {}).is_err());
        assert_eq!(group.len(), 1);
        assert!(group.wait(Duration::from_secs(5)));
        group.release();
    }
}
