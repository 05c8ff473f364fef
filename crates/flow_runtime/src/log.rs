use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a runtime log record. Lower values are more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LogLevel {
    Fatal = 10,
    Error = 20,
    Warn = 30,
    Info = 40,
    Debug = 50,
    Trace = 60,
    Audit = 98,
    Metric = 99,
}

impl LogLevel {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Fatal => "fatal",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
            LogLevel::Audit => "audit",
            LogLevel::Metric => "metric",
        }
    }

    /// Parses a console level name. `"off"` and unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "fatal" => Some(LogLevel::Fatal),
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            "audit" => Some(LogLevel::Audit),
            "metric" => Some(LogLevel::Metric),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One call to the runtime logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub msg: Value,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(level: LogLevel, msg: impl Into<Value>) -> Self {
        Self {
            level,
            id: None,
            node_type: None,
            name: None,
            msg: msg.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_node(mut self, id: &str, node_type: &str, name: Option<&str>) -> Self {
        self.id = Some(id.to_string());
        self.node_type = Some(node_type.to_string());
        self.name = name.map(str::to_string);
        self
    }

    /// The message rendered the way it is printed on the console.
    pub fn text(&self) -> String {
        match &self.msg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Where the runtime logger emits records to.
pub trait LogSink: Send + Sync {
    fn log(&self, record: &LogRecord);
    fn name(&self) -> String;
}

const CONSOLE_OFF: u8 = 0;

/// Default sink: hands records to `tracing`, filtered by the console level.
pub struct TracingSink {
    console: Arc<AtomicU8>,
}

impl LogSink for TracingSink {
    fn log(&self, record: &LogRecord) {
        let threshold = self.console.load(Ordering::Relaxed);
        let metric = matches!(record.level, LogLevel::Audit | LogLevel::Metric);
        if threshold == CONSOLE_OFF || (!metric && record.level.value() > threshold) {
            return;
        }
        let context = match (&record.node_type, &record.id) {
            (Some(t), Some(id)) => format!("{t}:{}", record.name.as_deref().unwrap_or(id)),
            _ => "runtime".to_string(),
        };
        let msg = record.text();
        match record.level {
            LogLevel::Trace => tracing::trace!(%context, "{msg}"),
            LogLevel::Debug => tracing::debug!(%context, "{msg}"),
            LogLevel::Info => tracing::info!(%context, "{msg}"),
            LogLevel::Warn => tracing::warn!(%context, "{msg}"),
            LogLevel::Error => tracing::error!(%context, "{msg}"),
            LogLevel::Fatal => tracing::error!(%context, "[FATAL] {msg}"),
            LogLevel::Audit | LogLevel::Metric => {
                tracing::trace!(target: "metric", %context, level = %record.level, "{msg}")
            }
        }
    }

    fn name(&self) -> String {
        "TracingSink".to_string()
    }
}

/// The runtime logger. Every node and subsystem logs through one of these;
/// its emit path can be swapped at runtime.
pub struct RuntimeLog {
    sink: RwLock<Arc<dyn LogSink>>,
    console: Arc<AtomicU8>,
}

impl RuntimeLog {
    pub const FATAL: LogLevel = LogLevel::Fatal;
    pub const ERROR: LogLevel = LogLevel::Error;
    pub const WARN: LogLevel = LogLevel::Warn;
    pub const INFO: LogLevel = LogLevel::Info;
    pub const DEBUG: LogLevel = LogLevel::Debug;
    pub const TRACE: LogLevel = LogLevel::Trace;
    pub const AUDIT: LogLevel = LogLevel::Audit;
    pub const METRIC: LogLevel = LogLevel::Metric;

    pub fn new() -> Arc<Self> {
        let console = Arc::new(AtomicU8::new(LogLevel::Info.value()));
        Arc::new(Self {
            sink: RwLock::new(Arc::new(TracingSink {
                console: console.clone(),
            })),
            console,
        })
    }

    pub fn log(&self, record: LogRecord) {
        self.sink().log(&record);
    }

    pub fn info(&self, msg: impl Into<Value>) {
        self.log(LogRecord::new(LogLevel::Info, msg));
    }

    pub fn warn(&self, msg: impl Into<Value>) {
        self.log(LogRecord::new(LogLevel::Warn, msg));
    }

    pub fn error(&self, msg: impl Into<Value>) {
        self.log(LogRecord::new(LogLevel::Error, msg));
    }

    pub fn sink(&self) -> Arc<dyn LogSink> {
        match self.sink.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Installs `sink` as the emit path and returns the previous one.
    pub fn replace_sink(&self, sink: Arc<dyn LogSink>) -> Arc<dyn LogSink> {
        let mut guard = match self.sink.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, sink)
    }

    /// `None` switches console output off.
    pub fn set_console_level(&self, level: Option<LogLevel>) {
        let value = level.map(LogLevel::value).unwrap_or(CONSOLE_OFF);
        self.console.store(value, Ordering::Relaxed);
    }

    pub fn console_level(&self) -> Option<LogLevel> {
        match self.console.load(Ordering::Relaxed) {
            CONSOLE_OFF => None,
            10 => Some(LogLevel::Fatal),
            20 => Some(LogLevel::Error),
            30 => Some(LogLevel::Warn),
            40 => Some(LogLevel::Info),
            50 => Some(LogLevel::Debug),
            60 => Some(LogLevel::Trace),
            98 => Some(LogLevel::Audit),
            _ => Some(LogLevel::Metric),
        }
    }
}

impl fmt::Debug for RuntimeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeLog")
            .field("sink", &self.sink().name())
            .field("console", &self.console_level())
            .finish()
    }
}
