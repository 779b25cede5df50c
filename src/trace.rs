//! Logging seam for the networking core.
//!
//! The core never writes to stdout or stderr itself. Every diagnostic is handed
//! to a [`Logger`] injected through the [`Environment`](crate::Environment), so
//! applications decide where messages go without the core depending on a
//! particular logging framework.
//!
//! ```rust
//! use mill_port::trace::{LogLevel, Logger, TracingLogger};
//!
//! let logger = TracingLogger::new(LogLevel::Warn);
//! assert!(!logger.enabled(LogLevel::Info));
//! logger.log(LogLevel::Error, "shown");
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

/// Severity of a log message, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Logger trait for network events
///
/// Library users can implement this trait to handle logging however they prefer.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);

    /// Whether messages at the given level would be kept.
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }
}

/// Default no-op logger that discards all messages
#[derive(Debug, Default, Clone)]
pub struct NoOpLogger;

impl Logger for NoOpLogger {
    fn log(&self, _level: LogLevel, _message: &str) {}

    fn enabled(&self, _level: LogLevel) -> bool {
        false
    }
}

/// Severity-filtered sink forwarding to the `tracing` macros.
///
/// Messages below the configured minimum are dropped before reaching
/// `tracing`. The minimum can be changed at runtime.
#[derive(Debug)]
pub struct TracingLogger {
    min_level: AtomicU8,
}

impl TracingLogger {
    pub fn new(min_level: LogLevel) -> Self {
        Self {
            min_level: AtomicU8::new(min_level as u8),
        }
    }

    pub fn min_level(&self) -> LogLevel {
        LogLevel::from_u8(self.min_level.load(Ordering::Relaxed))
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(LogLevel::Debug)
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        if !self.enabled(level) {
            return;
        }
        match level {
            LogLevel::Debug => tracing::debug!(target: "mill_port", "{}", message),
            LogLevel::Info => tracing::info!(target: "mill_port", "{}", message),
            LogLevel::Warn => tracing::warn!(target: "mill_port", "{}", message),
            LogLevel::Error => tracing::error!(target: "mill_port", "{}", message),
        }
    }

    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level()
    }
}
