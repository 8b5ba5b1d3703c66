//! Calculation event log with broadcast fan-out.
//!
//! The pool and the orchestrator report progress here. Entries are
//! mirrored to stdout and broadcast to any number of subscribers, so the
//! host application can bridge them to its own transport (the platform's
//! controllers stream them to operators during release debugging).

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Severity of a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A single calculation log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Correlation context: a calculation id or pool key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// RFC3339 timestamp.
    pub at: String,
}

impl LogEntry {
    fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            context: None,
            at: Utc::now().to_rfc3339(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    /// Attach a correlation context, builder-style.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Global event broadcaster.
pub static LOG_BROADCASTER: Lazy<LogBroadcaster> = Lazy::new(LogBroadcaster::new);

/// Broadcasts log entries to all subscribers and mirrors them to stdout.
pub struct LogBroadcaster {
    sender: broadcast::Sender<LogEntry>,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Record an entry: print it and fan it out (subscribers optional).
    pub fn log(&self, entry: LogEntry) {
        let tag = match entry.level {
            LogLevel::Info => "info",
            LogLevel::Success => "ok",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        };
        match &entry.context {
            Some(ctx) => println!("[{tag}] [{ctx}] {}", entry.message),
            None => println!("[{tag}] {}", entry.message),
        }
        let _ = self.sender.send(entry);
    }

    /// Subscribe to the raw broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream`, ready for the host's transport layer.
    pub fn stream(&self) -> BroadcastStream<LogEntry> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenient logging functions
pub fn log_info(msg: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::info(msg));
}

pub fn log_success(msg: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::success(msg));
}

pub fn log_warning(msg: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::warning(msg));
}

pub fn log_error(msg: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::error(msg));
}

pub fn log_info_ctx(msg: impl Into<String>, context: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::info(msg).with_context(context));
}

pub fn log_warning_ctx(msg: impl Into<String>, context: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::warning(msg).with_context(context));
}

pub fn log_error_ctx(msg: impl Into<String>, context: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::error(msg).with_context(context));
}
