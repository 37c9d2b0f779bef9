use serde::{Deserialize, Serialize};

/// A setup progress event: a human-readable message and overall progress in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub message: String,
    pub progress: f64,
}

impl Progress {
    pub fn new(message: impl Into<String>, progress: f64) -> Self {
        Self {
            message: message.into(),
            progress: progress.clamp(0.0, 1.0),
        }
    }
}

/// A sub-range of the overall 0–1 progress scale assigned to one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRange {
    pub from: f64,
    pub to: f64,
}

impl ProgressRange {
    pub const fn new(from: f64, to: f64) -> Self {
        Self { from, to }
    }

    /// Map a step-local fraction into the range. Fractions outside `[0, 1]` are clamped.
    pub fn at(&self, fraction: f64) -> f64 {
        self.from + (self.to - self.from) * fraction.clamp(0.0, 1.0)
    }
}

/// Byte counters of an in-flight download. `bytes_total` is `None` when the
/// server did not announce a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

impl TransferProgress {
    pub fn fraction(&self) -> f64 {
        let total = self.bytes_total.unwrap_or(1).max(1);
        self.bytes_done as f64 / total as f64
    }

    pub fn describe(&self, label: &str) -> String {
        const MB: u64 = 1_048_576;
        match self.bytes_total {
            Some(total) if total > 0 => format!(
                "{label}… {}% ({}MB / {}MB)",
                self.bytes_done.saturating_mul(100) / total,
                self.bytes_done / MB,
                total / MB
            ),
            _ => format!("{label}… {}MB", self.bytes_done / MB),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of live output from a sandboxed command, without its newline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: Stream,
    pub line: String,
}

impl OutputLine {
    /// The line as delivered to listeners; stderr lines carry an `[err] ` tag.
    pub fn tagged(&self) -> String {
        match self.stream {
            Stream::Stdout => self.line.clone(),
            Stream::Stderr => format!("[err] {}", self.line),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Progress(Progress),
    Output(OutputLine),
    SandboxUpdated { version: String },
}

/// Receiver of out-of-band events. Implementations must not block: events are
/// emitted from worker threads in the middle of downloads and extraction.
pub trait EventSink: Send + Sync {
    fn progress(&self, _progress: Progress) {}
    fn output(&self, _line: OutputLine) {}
    fn sandbox_updated(&self, _version: &str) {}
}

/// Discards every event.
pub struct NullSink;

impl EventSink for NullSink {}

impl EventSink for tokio::sync::broadcast::Sender<Event> {
    fn progress(&self, progress: Progress) {
        // No subscribers is not an error
        let _ = self.send(Event::Progress(progress));
    }

    fn output(&self, line: OutputLine) {
        let _ = self.send(Event::Output(line));
    }

    fn sandbox_updated(&self, version: &str) {
        let _ = self.send(Event::SandboxUpdated {
            version: version.to_string(),
        });
    }
}
