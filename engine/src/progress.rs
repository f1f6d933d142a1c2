//! Progress and log reporting.
//!
//! `ProgressSink` decouples the engine from any presentation layer (CLI,
//! GUI, service). Sinks may be called from several upload workers at once and
//! must serialize themselves internally.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

/// `tracing` target of mirrored log events, so front ends that already
/// display sink events can filter the duplicates out.
pub const EVENT_TARGET: &str = "backup_events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Items finished so far (copied, skipped or failed)
    pub processed: usize,
    pub total: usize,
    pub current: PathBuf,
    /// Bytes moved for this item; zero for skips and failures
    pub bytes_delta: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub message: String,
    pub severity: Severity,
}

/// Receiver of progress and log events from a running backup.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);

    fn on_log(&self, event: &LogEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _event: &ProgressEvent) {}

    fn on_log(&self, _event: &LogEvent) {}
}

/// Handle the executors report through.
///
/// Log events go to the sink and are mirrored to `tracing`.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn ProgressSink>,
}

impl Reporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Reporter { sink }
    }

    pub fn silent() -> Self {
        Reporter::new(Arc::new(NullSink))
    }

    pub fn progress(&self, processed: usize, total: usize, current: &Path, bytes_delta: u64) {
        self.sink.on_progress(&ProgressEvent {
            processed,
            total,
            current: current.to_path_buf(),
            bytes_delta,
        });
    }

    pub fn log(&self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Info | Severity::Success => info!(target: EVENT_TARGET, "{}", message),
            Severity::Warning => warn!(target: EVENT_TARGET, "{}", message),
            Severity::Error => error!(target: EVENT_TARGET, "{}", message),
        }
        self.sink.on_log(&LogEvent { message, severity });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(Severity::Info, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(Severity::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(Severity::Error, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(Severity::Success, message);
    }
}

/// Cooperative cancellation flag shared between the caller and every worker.
///
/// Setting it never interrupts in-flight I/O; loops poll it before taking
/// the next item.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that records everything it receives.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) progress: Mutex<Vec<ProgressEvent>>,
        pub(crate) logs: Mutex<Vec<LogEvent>>,
    }

    impl RecordingSink {
        pub(crate) fn messages(&self, severity: Severity) -> Vec<String> {
            self.logs
                .lock()
                .iter()
                .filter(|e| e.severity == severity)
                .map(|e| e.message.clone())
                .collect()
        }
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, event: &ProgressEvent) {
            self.progress.lock().push(event.clone());
        }

        fn on_log(&self, event: &LogEvent) {
            self.logs.lock().push(event.clone());
        }
    }

    /// Sink that raises a stop flag once `after` items have been processed.
    pub(crate) struct StopAfter {
        pub(crate) after: usize,
        pub(crate) stop: StopFlag,
    }

    impl ProgressSink for StopAfter {
        fn on_progress(&self, event: &ProgressEvent) {
            if event.processed >= self.after {
                self.stop.stop();
            }
        }

        fn on_log(&self, _event: &LogEvent) {}
    }
}
