//! Export progress reporting.
//!
//! The export coordinator emits one event per phase change and one after
//! every committed batch. Progress goes to **stderr** so stdout remains
//! parseable for scripts.

use serde::Serialize;
use std::io::Write;

/// Progress after a batch has been committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    /// Zero-based index of the batch just committed.
    pub batch_index: usize,
    pub total_batches: usize,
    pub messages_so_far: usize,
    pub total_messages: usize,
}

/// A single progress event for an export run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportEvent {
    /// Base and table are being created.
    Preparing { chat: String },
    /// A batch finished committing.
    Batch(ExportProgress),
    /// All batches committed.
    Finished { chat: String, records: usize },
}

/// Receives export progress. Implementations must not block.
pub trait ExportProgressReporter: Send + Sync {
    fn report(&self, event: ExportEvent);
}

/// Human-friendly progress on stderr: "export team  batch 2 / 3  200 / 250 messages".
pub struct StderrProgress;

impl ExportProgressReporter for StderrProgress {
    fn report(&self, event: ExportEvent) {
        let line = match &event {
            ExportEvent::Preparing { chat } => format!("export {}  preparing table...\n", chat),
            ExportEvent::Batch(p) => format!(
                "export  batch {} / {}  {} / {} messages\n",
                p.batch_index + 1,
                p.total_batches,
                format_number(p.messages_so_far as u64),
                format_number(p.total_messages as u64)
            ),
            ExportEvent::Finished { chat, records } => format!(
                "export {}  done  {} rows\n",
                chat,
                format_number(*records as u64)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ExportProgressReporter for JsonProgress {
    fn report(&self, event: ExportEvent) {
        let obj = match &event {
            ExportEvent::Preparing { chat } => serde_json::json!({
                "event": "progress",
                "chat": chat,
                "phase": "preparing"
            }),
            ExportEvent::Batch(p) => serde_json::json!({
                "event": "progress",
                "phase": "committing",
                "batch": p.batch_index + 1,
                "batches": p.total_batches,
                "n": p.messages_so_far,
                "total": p.total_messages
            }),
            ExportEvent::Finished { chat, records } => serde_json::json!({
                "event": "progress",
                "chat": chat,
                "phase": "finished",
                "records": records
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ExportProgressReporter for NoProgress {
    fn report(&self, _event: ExportEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ExportProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
