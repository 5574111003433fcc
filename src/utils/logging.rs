//! Logging glue.
//!
//! `init` installs the `tracing` subscriber for binaries and tests. The rest of
//! the module bridges the transport's leveled text lines into `tracing`:
//! transports write through a `TransportLogger`, which renders lines such as
//! `INF    3 [orders/orders] connecting to nsqd`, and a `LogSink` turns each
//! line back into a structured event.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::error::BrokerError;

/// Initialize tracing/logging for the application.
///
/// This uses a simple `with_max_level` configuration based on `default_level`.
pub fn init(default_level: &str) {
    let lvl = match default_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    // Use try_init so tests and libraries can call this multiple times without panicking
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}

/// Verbosity of transport log lines, ordered from most to least verbose.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Three letter prefix written at the start of every line.
    pub fn prefix(self) -> &'static str {
        match self {
            LogLevel::Debug => "DBG",
            LogLevel::Info => "INF",
            LogLevel::Warning => "WRN",
            LogLevel::Error => "ERR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for LogLevel {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" | "dbg" | "trace" => Ok(LogLevel::Debug),
            "info" | "inf" => Ok(LogLevel::Info),
            "warn" | "warning" | "wrn" => Ok(LogLevel::Warning),
            "error" | "err" => Ok(LogLevel::Error),
            other => Err(BrokerError::validation(
                "LogLevel",
                format!("unknown log level '{other}'"),
            )),
        }
    }
}

/// Destination for rendered transport log lines.
pub trait LogSink: Send + Sync {
    fn output(&self, line: &str);
}

/// Routes a line to the severity named by its prefix.
///
/// Lines shorter than a prefix, or with a prefix that is not recognized, are
/// treated as informational.
pub fn severity_of(line: &str) -> LogLevel {
    match line.get(..3) {
        Some("INF") => LogLevel::Info,
        Some("ERR") => LogLevel::Error,
        Some("WRN") => LogLevel::Warning,
        Some("DBG") => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

/// `LogSink` that forwards every line to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn output(&self, line: &str) {
        match severity_of(line) {
            LogLevel::Debug => tracing::debug!(target: "nsq", "{line}"),
            LogLevel::Info => tracing::info!(target: "nsq", "{line}"),
            LogLevel::Warning => tracing::warn!(target: "nsq", "{line}"),
            LogLevel::Error => tracing::error!(target: "nsq", "{line}"),
        }
    }
}

static INSTANCE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Leveled line writer handed to producers and consumers.
///
/// Every logger gets its own instance number so lines from different
/// connections can be told apart.
#[derive(Clone)]
pub struct TransportLogger {
    sink: Arc<dyn LogSink>,
    level: LogLevel,
    id: u64,
    context: String,
}

impl TransportLogger {
    pub fn new(sink: Arc<dyn LogSink>, level: LogLevel) -> Self {
        Self {
            sink,
            level,
            id: INSTANCE_COUNT.fetch_add(1, Ordering::Relaxed) + 1,
            context: String::new(),
        }
    }

    /// Logger writing to `tracing` at the given level.
    pub fn tracing(level: LogLevel) -> Self {
        Self::new(Arc::new(TracingSink), level)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level
    }

    pub fn log(&self, level: LogLevel, message: impl fmt::Display) {
        if !self.enabled(level) {
            return;
        }
        let line = if self.context.is_empty() {
            format!("{:<4} {:>3} {message}", level.prefix(), self.id)
        } else {
            format!(
                "{:<4} {:>3} [{}] {message}",
                level.prefix(),
                self.id,
                self.context
            )
        };
        self.sink.output(&line);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(LogLevel::Error, message);
    }
}

impl fmt::Debug for TransportLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportLogger")
            .field("level", &self.level)
            .field("id", &self.id)
            .field("context", &self.context)
            .finish()
    }
}
