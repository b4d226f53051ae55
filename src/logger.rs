use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::level_filters::LevelFilter;

const LOG_CAPACITY: usize = 10_000;

/// Log level enum for type-safe logging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    /// Most verbose level a `tracing` filter lets through
    pub fn from_level_filter(filter: LevelFilter) -> Self {
        if filter >= LevelFilter::DEBUG {
            LogLevel::Debug
        } else if filter >= LevelFilter::INFO {
            LogLevel::Info
        } else if filter >= LevelFilter::WARN {
            LogLevel::Warn
        } else {
            LogLevel::Error
        }
    }
}

/// One recorded log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Name of the logger that produced the entry (module or pipeline name)
    pub source: String,
}

/// Simple circular buffer for fixed-size log storage
struct CircularBuffer {
    buffer: Vec<LogEntry>,
    head: usize,
    size: usize,
    capacity: usize,
}

impl CircularBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            head: 0,
            size: 0,
            capacity,
        }
    }

    fn push(&mut self, item: LogEntry) {
        if self.size < self.capacity {
            self.buffer.push(item);
            self.size += 1;
        } else {
            self.buffer[self.head] = item;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    fn to_vec(&self) -> Vec<LogEntry> {
        if self.size < self.capacity {
            self.buffer.clone()
        } else {
            // Return items in chronological order
            let mut result = Vec::with_capacity(self.size);
            result.extend_from_slice(&self.buffer[self.head..]);
            result.extend_from_slice(&self.buffer[..self.head]);
            result
        }
    }
}

/// Commands for the logger thread
enum LogCommand {
    Log(LogEntry),
    GetLogs(Sender<Vec<LogEntry>>),
}

/// Process-wide log collector.
///
/// Entries are kept in a bounded in-memory buffer owned by a background thread
/// and are forwarded to `tracing` so that an installed subscriber prints them.
pub struct Logger {
    sender: Sender<LogCommand>,
    min_level: Arc<AtomicU8>,
}

impl Logger {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(LOG_CAPACITY);
        let min_level = Arc::new(AtomicU8::new(LogLevel::Info as u8));

        // Spawn background thread to handle logs
        std::thread::spawn(move || {
            Self::logger_thread(receiver);
        });

        Self { sender, min_level }
    }

    /// Background thread that manages the log buffer
    fn logger_thread(receiver: Receiver<LogCommand>) {
        let mut buffer = CircularBuffer::new(LOG_CAPACITY);

        for cmd in receiver {
            match cmd {
                LogCommand::Log(entry) => {
                    buffer.push(entry);
                }
                LogCommand::GetLogs(response_tx) => {
                    let _ = response_tx.send(buffer.to_vec());
                }
            }
        }
    }

    /// Check whether a level passes the runtime filter
    pub fn enabled(&self, level: LogLevel) -> bool {
        (level as u8) >= self.min_level.load(Ordering::Relaxed)
    }

    /// Log with enum level (non-blocking)
    pub fn log(&self, level: LogLevel, message: &str, source: &str) {
        if !self.enabled(level) {
            return;
        }

        match level {
            LogLevel::Error => tracing::error!(target: "blobflow", source, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "blobflow", source, "{}", message),
            LogLevel::Info => tracing::info!(target: "blobflow", source, "{}", message),
            LogLevel::Debug => tracing::debug!(target: "blobflow", source, "{}", message),
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            source: source.to_string(),
        };

        // Non-blocking send (drops log if channel is full)
        let _ = self.sender.try_send(LogCommand::Log(entry));
    }

    /// Set minimum log level (runtime filtering)
    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_logs(&self) -> Vec<LogEntry> {
        let (response_tx, response_rx) = bounded(1);
        if self.sender.send(LogCommand::GetLogs(response_tx)).is_ok() {
            response_rx.recv().unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// Entries produced by one named logger
    pub fn logs_from(&self, source: &str) -> Vec<LogEntry> {
        self.get_logs()
            .into_iter()
            .filter(|entry| entry.source == source)
            .collect()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

// Global logger instance
lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = Logger::new();
}

/// Install a `tracing` subscriber that prints forwarded log lines.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. The minimum
/// level of [`LOGGER`] follows the most verbose level the filter enables.
/// Calling this more than once is harmless.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let level = filter
        .max_level_hint()
        .map(LogLevel::from_level_filter)
        .unwrap_or(LogLevel::Info);

    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
    {
        LOGGER.set_min_level(level);
    }
}

/// Destination of every log line the pipeline and its modules write
///
/// The default sink is the global [`LOGGER`]; pass another one to
/// `PipelineBuilder::log_sink` to capture or redirect the output.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, source: &str, message: &str);

    /// Whether lines of `level` would be kept; used to skip building them
    fn enabled(&self, _level: LogLevel) -> bool {
        true
    }
}

impl LogSink for Logger {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        Logger::log(self, level, message, source);
    }

    fn enabled(&self, level: LogLevel) -> bool {
        Logger::enabled(self, level)
    }
}

/// Forwards to the global [`LOGGER`]
struct GlobalSink;

impl LogSink for GlobalSink {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        LOGGER.log(level, message, source);
    }

    fn enabled(&self, level: LogLevel) -> bool {
        LOGGER.enabled(level)
    }
}

/// A leveled logger bound to a name, writing into a [`LogSink`]
#[derive(Clone)]
pub struct NamedLogger {
    name: String,
    sink: Arc<dyn LogSink>,
    seen_once: Arc<Mutex<HashSet<String>>>,
}

impl NamedLogger {
    /// Logger writing into the global [`LOGGER`]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_sink(name, Arc::new(GlobalSink))
    }

    pub fn with_sink(name: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            name: name.into(),
            sink,
            seen_once: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Another logger on the same sink
    pub fn named(&self, name: impl Into<String>) -> Self {
        Self::with_sink(name, Arc::clone(&self.sink))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.sink.log(level, &self.name, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    /// Log a message only the first time it is seen by this logger
    pub fn once(&self, level: LogLevel, message: &str) {
        let first = match self.seen_once.lock() {
            Ok(mut seen) => seen.insert(message.to_string()),
            Err(_) => true,
        };
        if first {
            self.log(level, message);
        }
    }

    /// Whether debug lines would currently be recorded
    pub fn debug_enabled(&self) -> bool {
        self.sink.enabled(LogLevel::Debug)
    }
}

impl fmt::Debug for NamedLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLogger").field("name", &self.name).finish()
    }
}
