pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod progress;
mod supervisor;

pub use config::ServiceConfig;
pub use error::Error;
pub use job::{generate_job_id, JobKind, JobRecord, JobState};
pub use manager::{JobEvent, JobManager};
pub use progress::{scan_chunk, ProgressSignal};
