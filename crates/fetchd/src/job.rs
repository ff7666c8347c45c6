use std::path::PathBuf;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-declared classification of a job. Informational only; the manager
/// supervises every kind the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Video,
    Audio,
    Search,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Video => write!(f, "video"),
            JobKind::Audio => write!(f, "audio"),
            JobKind::Search => write!(f, "search"),
        }
    }
}

/// Lifecycle state of a job: pending -> running -> completed | failed.
/// No transition ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// One background invocation of an external long-running process, tracked
/// end to end by the job manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Opaque unique identifier, assigned before the process is launched.
    pub id: String,
    /// The resource being fetched. Not validated here.
    pub source_url: String,
    pub kind: JobKind,
    pub state: JobState,
    /// Best-effort completion percentage in [0, 100], parsed from output.
    pub progress_percent: Option<f64>,
    /// Destination file name, populated when the output reveals one.
    pub resolved_filename: Option<String>,
    /// Set only on failure: exit code and/or captured output tail.
    pub error_detail: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set exactly when the job reaches a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Caller-supplied output path hint. Immutable once set.
    pub expected_output_path: Option<PathBuf>,
}

impl JobRecord {
    /// Create a fresh record in `pending` state.
    pub fn new(
        id: String,
        source_url: String,
        kind: JobKind,
        expected_output_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            source_url,
            kind,
            state: JobState::Pending,
            progress_percent: None,
            resolved_filename: None,
            error_detail: None,
            started_at: Utc::now(),
            finished_at: None,
            expected_output_path,
        }
    }

    /// Wall-clock time this job has run: up to `finished_at` once terminal,
    /// up to now otherwise.
    pub fn elapsed(&self) -> Duration {
        self.finished_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// Generate a fresh job identifier: UTC timestamp prefix plus a random
/// suffix. Collision-resistant in practice, not cryptographically so.
pub fn generate_job_id() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", stamp, &suffix[..8])
}
