use std::sync::{Arc, Mutex};

use flow_runtime::{LogLevel, LogRecord, LogSink, RuntimeLog};
use tracing::warn;

/// Captures every record written to a runtime log while still forwarding it
/// to the sink it replaced.
pub struct LogSpy {
    records: Mutex<Vec<LogRecord>>,
    previous: Arc<dyn LogSink>,
}

impl LogSpy {
    pub const FATAL: LogLevel = LogLevel::Fatal;
    pub const ERROR: LogLevel = LogLevel::Error;
    pub const WARN: LogLevel = LogLevel::Warn;
    pub const INFO: LogLevel = LogLevel::Info;
    pub const DEBUG: LogLevel = LogLevel::Debug;
    pub const TRACE: LogLevel = LogLevel::Trace;
    pub const AUDIT: LogLevel = LogLevel::Audit;
    pub const METRIC: LogLevel = LogLevel::Metric;

    /// Installs a new spy as the emit path of `log`.
    pub fn attach(log: &RuntimeLog) -> Arc<Self> {
        let spy = Arc::new(Self {
            records: Mutex::new(Vec::new()),
            previous: log.sink(),
        });
        log.replace_sink(spy.clone());
        spy
    }

    /// Puts the replaced sink back, unless something else took over the log
    /// since this spy was attached.
    pub fn restore(&self, log: &RuntimeLog) -> bool {
        let current = log.sink();
        if !std::ptr::addr_eq(Arc::as_ptr(&current), self as *const Self) {
            warn!(sink = %current.name(), "runtime log no longer goes through the spy, not restoring");
            return false;
        }
        log.replace_sink(self.previous.clone());
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.lock().clone()
    }

    pub fn at_level(&self, level: LogLevel) -> Vec<LogRecord> {
        self.lock()
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Rendered message text of every record, in order.
    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(LogRecord::text).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|r| r.text().contains(needle))
    }

    pub fn call_count(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl LogSink for LogSpy {
    fn log(&self, record: &LogRecord) {
        self.lock().push(record.clone());
        self.previous.log(record);
    }

    fn name(&self) -> String {
        "LogSpy".to_string()
    }
}

impl std::fmt::Debug for LogSpy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSpy")
            .field("records", &self.call_count())
            .field("previous", &self.previous.name())
            .finish()
    }
}
