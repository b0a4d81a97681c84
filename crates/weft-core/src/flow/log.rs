//! Structured run log sink.
//!
//! The runtime and step executor report run-level events as `LogEntry`
//! values. `TracingLogSink` forwards them to `tracing`; `MemoryLogSink` keeps
//! them for inspection.

use std::sync::Mutex;

use weft_types::log::{LogEntry, LogLevel};

/// Receiver of structured run log events.
///
/// Implementations must not block; persistence-backed sinks should buffer.
pub trait LogSink: Send + Sync {
    fn record(&self, entry: &LogEntry);
}

/// Forwards entries to `tracing` at the matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn record(&self, entry: &LogEntry) {
        let tags = &entry.tags;
        let run_id = tags.run_id.map(|id| id.to_string()).unwrap_or_default();
        let step_id = tags.step_id.as_deref().unwrap_or("");
        let attempt = tags.attempt.unwrap_or(0);

        match entry.level {
            LogLevel::Debug => tracing::debug!(
                run_id = run_id.as_str(),
                step_id,
                attempt,
                payload = %entry.payload,
                "{}",
                entry.message
            ),
            LogLevel::Info => tracing::info!(
                run_id = run_id.as_str(),
                step_id,
                attempt,
                payload = %entry.payload,
                "{}",
                entry.message
            ),
            LogLevel::Warn => tracing::warn!(
                run_id = run_id.as_str(),
                step_id,
                attempt,
                payload = %entry.payload,
                "{}",
                entry.message
            ),
            LogLevel::Error => tracing::error!(
                run_id = run_id.as_str(),
                step_id,
                attempt,
                payload = %entry.payload,
                "{}",
                entry.message
            ),
        }
    }
}

/// Collects entries in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Messages of every entry at `level`, in arrival order.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == level)
            .map(|e| e.message)
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn record(&self, entry: &LogEntry) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry.clone()),
            Err(poisoned) => poisoned.into_inner().push(entry.clone()),
        }
    }
}
