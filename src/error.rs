//! Typed pipeline errors.
//!
//! Client code propagates `anyhow::Error` with context. At a fatal stage
//! boundary the export coordinator wraps that error in a [`PipelineError`]
//! naming the stage, so callers can tell an authentication failure from a
//! half-committed export without string matching.

use serde::Serialize;
use std::fmt;

/// A contiguous run of rows already written to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceRange {
    pub batch_index: usize,
    /// Record offset of the first row, relative to the whole export.
    pub start: usize,
    /// One past the last row.
    pub end: usize,
}

impl SliceRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for SliceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch {} rows {}..{}", self.batch_index + 1, self.start, self.end)
    }
}

/// Where a fatal failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Auth,
    FetchMessages,
    Completion,
    CreateBase,
    CreateTable,
    /// A commit failed after `committed` slices were written.
    Commit { committed: Vec<SliceRange> },
    Cancelled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Auth => f.write_str("authentication"),
            Stage::FetchMessages => f.write_str("fetching messages"),
            Stage::Completion => f.write_str("completion"),
            Stage::CreateBase => f.write_str("creating base"),
            Stage::CreateTable => f.write_str("creating table"),
            Stage::Commit { committed } if committed.is_empty() => {
                f.write_str("committing rows (nothing committed)")
            }
            Stage::Commit { committed } => {
                let rows: usize = committed.iter().map(SliceRange::len).sum();
                write!(
                    f,
                    "committing rows ({} row(s) in {} slice(s) already committed, last: {})",
                    rows,
                    committed.len(),
                    committed[committed.len() - 1]
                )
            }
            Stage::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {source:#}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

impl PipelineError {
    pub fn new(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(Stage::Cancelled, anyhow::anyhow!("export cancelled by caller"))
    }

    /// Slices written before the failure. Empty unless the stage is a commit.
    pub fn committed(&self) -> &[SliceRange] {
        match &self.stage {
            Stage::Commit { committed } => committed,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_error_names_slices() {
        let err = PipelineError::new(
            Stage::Commit {
                committed: vec![
                    SliceRange {
                        batch_index: 0,
                        start: 0,
                        end: 100,
                    },
                    SliceRange {
                        batch_index: 1,
                        start: 100,
                        end: 200,
                    },
                ],
            },
            anyhow::anyhow!("HTTP 500"),
        );
        let msg = err.to_string();
        assert!(msg.contains("200 row(s) in 2 slice(s)"), "{}", msg);
        assert!(msg.contains("batch 2 rows 100..200"), "{}", msg);
        assert!(msg.contains("HTTP 500"));
        assert_eq!(err.committed().len(), 2);
    }

    #[test]
    fn other_stages_have_no_slices() {
        let err = PipelineError::new(Stage::Auth, anyhow::anyhow!("bad secret"));
        assert!(err.committed().is_empty());
        assert!(err.to_string().starts_with("authentication failed"));
    }
}
