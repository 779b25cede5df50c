//! Reference-counted networking subsystem.
//!
//! The OS networking stack is started when the first [`Environment`] using a
//! [`Subsystem`] is created and cleaned up when the last one is dropped. The
//! live count and recorded start result are kept behind a mutex, so any
//! number of environments may be created and dropped from any thread.
//!
//! [`Environment`]: crate::Environment

use std::{
    io,
    sync::{Arc, LazyLock, Mutex, MutexGuard},
};

use socket2::{Domain, Socket, Type};

use crate::trace::{LogLevel, Logger};

/// Start and stop hooks of a networking stack.
pub trait NetworkStack: Send + Sync {
    fn startup(&self) -> io::Result<()>;

    /// Called once after the last user released a successfully started stack.
    fn cleanup(&self);
}

/// The OS stack.
///
/// Start-up verifies that sockets can be created by opening and closing an
/// IPv4 datagram probe. There is nothing to release on cleanup.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeStack;

impl NetworkStack for NativeStack {
    fn startup(&self) -> io::Result<()> {
        Socket::new(Domain::IPV4, Type::DGRAM, None).map(drop)
    }

    fn cleanup(&self) {}
}

/// Snapshot of a subsystem's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubsystemStats {
    /// Environments currently holding the subsystem.
    pub live: usize,
    /// Times the stack was started.
    pub startups: u64,
    /// Times the stack was cleaned up.
    pub cleanups: u64,
}

#[derive(Default)]
struct State {
    live: usize,
    // None: not initialised. Some(Err): start-up failed with that kind.
    init_result: Option<Result<(), io::ErrorKind>>,
    startups: u64,
    cleanups: u64,
}

/// Shared handle to a networking stack and its user count.
pub struct Subsystem {
    stack: Box<dyn NetworkStack>,
    state: Mutex<State>,
}

static GLOBAL: LazyLock<Arc<Subsystem>> = LazyLock::new(|| Arc::new(Subsystem::new(NativeStack)));

impl Subsystem {
    pub fn new<S>(stack: S) -> Self
    where
        S: NetworkStack + 'static,
    {
        Self {
            stack: Box::new(stack),
            state: Mutex::new(State::default()),
        }
    }

    /// Process-wide subsystem over the native stack.
    pub fn global() -> Arc<Subsystem> {
        Arc::clone(&GLOBAL)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers one more user, starting the stack for the first one.
    pub(crate) fn acquire(&self, logger: &dyn Logger) {
        let mut state = self.lock();
        state.live += 1;
        if state.live > 1 {
            return;
        }

        state.startups += 1;
        match self.stack.startup() {
            Ok(()) => state.init_result = Some(Ok(())),
            Err(e) => {
                logger.log(
                    LogLevel::Error,
                    &format!("Error initializing networking subsystem, {}", e),
                );
                state.init_result = Some(Err(e.kind()));
            }
        }
    }

    /// Drops one user, cleaning up after the last one.
    pub(crate) fn release(&self) {
        let mut state = self.lock();
        if state.live == 0 {
            return;
        }
        state.live -= 1;
        if state.live > 0 {
            return;
        }

        if state.init_result == Some(Ok(())) {
            self.stack.cleanup();
            state.cleanups += 1;
        }
        state.init_result = None;
    }

    /// True while the stack is started and start-up succeeded.
    pub fn is_initialized(&self) -> bool {
        self.lock().init_result == Some(Ok(()))
    }

    /// Error kind recorded by a failed start-up, while users remain.
    pub fn init_error(&self) -> Option<io::ErrorKind> {
        match self.lock().init_result {
            Some(Err(kind)) => Some(kind),
            _ => None,
        }
    }

    pub fn stats(&self) -> SubsystemStats {
        let state = self.lock();
        SubsystemStats {
            live: state.live,
            startups: state.startups,
            cleanups: state.cleanups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::NoOpLogger;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        fail: AtomicBool,
        up: AtomicUsize,
        down: AtomicUsize,
    }

    impl NetworkStack for Arc<Counting> {
        fn startup(&self) -> io::Result<()> {
            self.up.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::Unsupported));
            }
            Ok(())
        }

        fn cleanup(&self) {
            self.down.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_started_once_and_cleaned_once() {
        let stack = Arc::new(Counting::default());
        let subsystem = Subsystem::new(stack.clone());

        for _ in 0..3 {
            subsystem.acquire(&NoOpLogger);
        }
        assert!(subsystem.is_initialized());
        assert_eq!(stack.up.load(Ordering::SeqCst), 1);

        subsystem.release();
        subsystem.release();
        assert_eq!(stack.down.load(Ordering::SeqCst), 0);
        assert!(subsystem.is_initialized());

        subsystem.release();
        assert_eq!(stack.down.load(Ordering::SeqCst), 1);
        assert!(!subsystem.is_initialized());
        assert_eq!(
            subsystem.stats(),
            SubsystemStats {
                live: 0,
                startups: 1,
                cleanups: 1
            }
        );
    }

    #[test]
    fn test_failed_startup_is_recorded_and_not_cleaned() {
        let stack = Arc::new(Counting::default());
        stack.fail.store(true, Ordering::SeqCst);
        let subsystem = Subsystem::new(stack.clone());

        subsystem.acquire(&NoOpLogger);
        assert!(!subsystem.is_initialized());
        assert_eq!(subsystem.init_error(), Some(io::ErrorKind::Unsupported));

        subsystem.release();
        assert_eq!(stack.down.load(Ordering::SeqCst), 0);
        assert_eq!(subsystem.init_error(), None);
    }

    #[test]
    fn test_extra_release_is_ignored() {
        let stack = Arc::new(Counting::default());
        let subsystem = Subsystem::new(stack.clone());
        subsystem.release();
        assert_eq!(subsystem.stats().live, 0);
        assert_eq!(stack.down.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_native_stack_starts() {
        assert!(NativeStack.startup().is_ok());
    }
}
