use thiserror::Error;

/// Errors returned by the job manager's synchronous surface.
///
/// Process-level failures never appear here; they are captured into the
/// owning `JobRecord` and surfaced through its `error_detail` field.
#[derive(Debug, Error)]
pub enum Error {
    /// A job with this identifier is already registered.
    #[error("job id already registered: {0}")]
    DuplicateJobId(String),

    /// No job with this identifier is known to the manager.
    #[error("unknown job id: {0}")]
    UnknownJobId(String),

    /// The job exists but is no longer pending or running.
    #[error("job is not active: {0}")]
    JobNotActive(String),
}
