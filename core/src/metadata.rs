//! Per-step execution metadata and the recorder that collects it.

use crate::validate::ValidatorResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Http,
    Database,
    Plugin,
    Composite,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepKind::Http => "http",
            StepKind::Database => "database",
            StepKind::Plugin => "plugin",
            StepKind::Composite => "composite",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimingStats {
    pub elapsed_ms: Option<f64>,
    pub response_time_ms: Option<f64>,
    pub content_size: Option<u64>,
}

impl TimingStats {
    pub fn set_elapsed(&mut self, elapsed: Duration) {
        self.elapsed_ms = Some(millis(elapsed));
    }

    pub fn set_response_time(&mut self, elapsed: Duration) {
        self.response_time_ms = Some(millis(elapsed));
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Diagnostic record of one simple step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub kind: StepKind,
    pub name: String,
    /// Request url, connection url or script name.
    pub identity: String,
    pub status: ExecutionStatus,
    pub started_at: String,
    #[serde(default)]
    pub request: Value,
    #[serde(default)]
    pub stat: TimingStats,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub validators: Vec<ValidatorResult>,
}

impl ExecutionMetadata {
    pub fn start(kind: StepKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            identity: String::new(),
            status: ExecutionStatus::Running,
            started_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "unknown".to_string()),
            request: Value::Null,
            stat: TimingStats::default(),
            error: None,
            result: Value::Null,
            validators: Vec::new(),
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
    }
}

/// One element of a case's metadata sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum MetadataEntry {
    Step(ExecutionMetadata),
    Composite {
        name: String,
        status: ExecutionStatus,
        steps: Vec<MetadataEntry>,
    },
}

impl MetadataEntry {
    pub fn name(&self) -> &str {
        match self {
            MetadataEntry::Step(meta) => &meta.name,
            MetadataEntry::Composite { name, .. } => name,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            MetadataEntry::Step(meta) => meta.status,
            MetadataEntry::Composite { status, .. } => *status,
        }
    }
}

/// Append-only metadata sequence of one case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataRecorder {
    entries: Vec<MetadataEntry>,
}

impl MetadataRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_step(&mut self, metadata: ExecutionMetadata) {
        self.entries.push(MetadataEntry::Step(metadata));
    }

    pub fn record_composite(
        &mut self,
        name: impl Into<String>,
        status: ExecutionStatus,
        nested: MetadataRecorder,
    ) {
        self.entries.push(MetadataEntry::Composite {
            name: name.into(),
            status,
            steps: nested.entries,
        });
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<MetadataEntry> {
        self.entries
    }

    pub fn last(&self) -> Option<&MetadataEntry> {
        self.entries.last()
    }

    pub fn has_failures(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.status() == ExecutionStatus::Failed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_entries_nest_child_sequences() {
        let mut child = MetadataRecorder::new();
        let mut meta = ExecutionMetadata::start(StepKind::Database, "count users");
        meta.finish(ExecutionStatus::Passed);
        child.record_step(meta);

        let mut parent = MetadataRecorder::new();
        parent.record_composite("setup", ExecutionStatus::Passed, child);

        assert_eq!(parent.len(), 1);
        match parent.last() {
            Some(MetadataEntry::Composite { name, steps, .. }) => {
                assert_eq!(name, "setup");
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].name(), "count users");
            }
            other => panic!("unexpected entry: {other:?}"),
        }
        assert!(!parent.has_failures());
    }

    #[test]
    fn timing_is_recorded_in_milliseconds() {
        let mut stat = TimingStats::default();
        stat.set_elapsed(Duration::from_millis(1500));
        assert_eq!(stat.elapsed_ms, Some(1500.0));
        assert_eq!(stat.response_time_ms, None);
    }
}
