//! Severity-tagged logging sink.
//!
//! The engine never writes to stderr or a file directly: every diagnostic
//! line is handed to a caller-supplied callback, the same way the original
//! `mqtt_wss_new` takes a `log_ctx` plus `mws_debug`/`mws_warn`/`mws_error`
//! callers throughout. Internally we also emit `tracing` events at matching
//! levels so a host process that already runs a `tracing` subscriber gets
//! the same information for free; the callback remains the contract.

use std::fmt;

/// Severity of a single log line, mirroring the four levels the original
/// engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Warn,
    Error,
    Fatal,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// The caller-supplied log callback. Invoked with the severity and a
/// formatted message; the engine never blocks on its return.
pub type LogCallback = Box<dyn FnMut(Level, &str) + Send>;

/// Wraps the caller's callback and a fixed prefix (matching the source's
/// `log_prefix` argument to `mqtt_wss_new`), and fans each line out to both
/// the callback and `tracing`.
pub struct LogSink {
    prefix: String,
    callback: LogCallback,
}

impl LogSink {
    pub fn new(prefix: impl Into<String>, callback: LogCallback) -> Self {
        Self {
            prefix: prefix.into(),
            callback,
        }
    }

    pub fn log(&mut self, level: Level, args: fmt::Arguments<'_>) {
        let msg = format!("{}: {}", self.prefix, args);
        match level {
            Level::Debug => tracing::debug!(target: "mqtt_wss", "{}", msg),
            Level::Warn => tracing::warn!(target: "mqtt_wss", "{}", msg),
            Level::Error => tracing::error!(target: "mqtt_wss", "{}", msg),
            Level::Fatal => tracing::error!(target: "mqtt_wss", fatal = true, "{}", msg),
        }
        (self.callback)(level, &msg);
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink").field("prefix", &self.prefix).finish()
    }
}

macro_rules! log_debug {
    ($sink:expr, $($arg:tt)*) => { $sink.log($crate::log::Level::Debug, format_args!($($arg)*)) };
}
macro_rules! log_warn {
    ($sink:expr, $($arg:tt)*) => { $sink.log($crate::log::Level::Warn, format_args!($($arg)*)) };
}
macro_rules! log_error {
    ($sink:expr, $($arg:tt)*) => { $sink.log($crate::log::Level::Error, format_args!($($arg)*)) };
}
macro_rules! log_fatal {
    ($sink:expr, $($arg:tt)*) => { $sink.log($crate::log::Level::Fatal, format_args!($($arg)*)) };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_fatal;
pub(crate) use log_warn;
