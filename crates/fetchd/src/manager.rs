use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use log::info;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::config::ServiceConfig;
use crate::error::Error;
use crate::job::{self, JobKind, JobRecord, JobState};
use crate::supervisor::Supervisor;

/// The in-memory job registry. Lost on restart.
pub(crate) type JobStore = Arc<Mutex<HashMap<String, JobRecord>>>;

/// Cancellation handles for jobs that have not reached a terminal state.
pub(crate) type CancelMap = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

/// Lifecycle notification published on the manager's event channel.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A progress signal was extracted from the process output.
    Progress {
        id: String,
        percent: Option<f64>,
        filename: Option<String>,
    },
    /// The job reached `completed`; carries the final record.
    Completed(JobRecord),
    /// The job reached `failed`; carries the final record.
    Failed(JobRecord),
}

/// Public entry point for background jobs: issues identifiers, starts jobs,
/// answers queries, publishes lifecycle notifications, and prunes retired
/// records.
///
/// Construct one per service process and hand clones to whichever layers
/// need it; clones are cheap and share a single job registry. There is no
/// process-wide singleton.
#[derive(Clone)]
pub struct JobManager {
    jobs: JobStore,
    cancels: CancelMap,
    events: broadcast::Sender<JobEvent>,
    cfg: ServiceConfig,
}

impl JobManager {
    pub fn new(cfg: ServiceConfig) -> Self {
        let (events, _) = broadcast::channel(cfg.event_capacity.max(1));
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            events,
            cfg,
        }
    }

    /// Return a fresh, collision-resistant job identifier.
    pub fn generate_id(&self) -> String {
        job::generate_job_id()
    }

    /// Subscribe to lifecycle notifications. Every subscriber gets its own
    /// buffered receiver; a slow subscriber loses old events instead of
    /// blocking delivery to the others.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Register a job and hand it off to a supervisor task. Returns as soon
    /// as the record is registered; it never waits on the process, and
    /// launch failures surface later through the record itself.
    pub fn start_job(
        &self,
        id: String,
        source_url: String,
        kind: JobKind,
        command: String,
        args: Vec<String>,
        expected_output_path: Option<PathBuf>,
    ) -> Result<String, Error> {
        {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&id) {
                return Err(Error::DuplicateJobId(id));
            }
            let record = JobRecord::new(id.clone(), source_url.clone(), kind, expected_output_path);
            jobs.insert(id.clone(), record);
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().unwrap().insert(id.clone(), cancel_tx);

        let supervisor = Supervisor::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.cancels),
            self.events.clone(),
            self.cfg.output_tail_bytes,
            self.cfg
                .job_timeout_secs
                .map(std::time::Duration::from_secs),
        );
        info!("Job {}: registered {} job for {}", id, kind, source_url);
        tokio::spawn(supervisor.run(id.clone(), command, args, cancel_rx));

        Ok(id)
    }

    /// Point lookup. Returns `None` for unknown identifiers, never an error.
    pub fn get_job(&self, id: &str) -> Option<JobRecord> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    /// All known jobs, in no particular order.
    pub fn list_jobs(&self) -> Vec<JobRecord> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    /// Jobs currently pending or running.
    pub fn list_active(&self) -> Vec<JobRecord> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Request cancellation of an active job. The supervisor kills the
    /// process and drives the record to `failed` with a cancellation
    /// message; this call only delivers the request.
    pub fn cancel(&self, id: &str) -> Result<(), Error> {
        {
            let jobs = self.jobs.lock().unwrap();
            match jobs.get(id) {
                None => return Err(Error::UnknownJobId(id.to_string())),
                Some(record) if record.state.is_terminal() => {
                    return Err(Error::JobNotActive(id.to_string()))
                }
                Some(_) => {}
            }
        }
        match self.cancels.lock().unwrap().remove(id) {
            Some(tx) => {
                let _ = tx.send(());
                info!("Job {}: cancellation requested", id);
                Ok(())
            }
            // The job finalized between the two lookups.
            None => Err(Error::JobNotActive(id.to_string())),
        }
    }

    /// Remove terminal records whose `finished_at` is older than `age`.
    /// Pending and running jobs are never pruned, regardless of age.
    /// Returns the number of records removed.
    pub fn prune_older_than(&self, age: Duration) -> usize {
        let cutoff = Utc::now() - age;
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, record| {
            !(record.state.is_terminal()
                && record.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
        let removed = before - jobs.len();
        if removed > 0 {
            info!("Pruned {} retired job record(s)", removed);
        }
        removed
    }

    /// Spawn the periodic retention sweep, pruning terminal records older
    /// than the configured retention age.
    pub fn spawn_retention_sweep(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let every = std::time::Duration::from_secs(self.cfg.prune_interval_secs.max(1));
        let age = Duration::seconds(self.cfg.retention_secs as i64);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                manager.prune_older_than(age);
            }
        })
    }

    /// Render a human-readable report over all known jobs, grouped into
    /// active / completed / failed buckets. Malformed or partial records
    /// degrade to placeholder fields; this never fails.
    pub fn summarize(&self) -> String {
        let mut jobs = self.list_jobs();
        if jobs.is_empty() {
            return "No jobs.".to_string();
        }
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        let mut active = Vec::new();
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        for job in &jobs {
            match job.state {
                JobState::Completed => completed.push(job),
                JobState::Failed => failed.push(job),
                _ => active.push(job),
            }
        }

        let mut out = format!(
            "Jobs: {} total, {} active, {} completed, {} failed\n",
            jobs.len(),
            active.len(),
            completed.len(),
            failed.len()
        );

        if !active.is_empty() {
            out.push_str("\nActive:\n");
            for job in active {
                let percent = job
                    .progress_percent
                    .map(|p| format!("{:.1}%", p))
                    .unwrap_or_else(|| "-".to_string());
                let name = job.resolved_filename.as_deref().unwrap_or("-");
                out.push_str(&format!(
                    "  {}  {}  {}  {}  {}  {}\n",
                    job.id,
                    job.kind,
                    job.state,
                    format_duration(job.elapsed()),
                    percent,
                    name
                ));
            }
        }

        if !completed.is_empty() {
            out.push_str("\nCompleted:\n");
            for job in completed {
                let name = job.resolved_filename.as_deref().unwrap_or("-");
                out.push_str(&format!(
                    "  {}  {}  {}  {}\n",
                    job.id,
                    job.kind,
                    format_duration(job.elapsed()),
                    name
                ));
            }
        }

        if !failed.is_empty() {
            out.push_str("\nFailed:\n");
            for job in failed {
                let detail = job
                    .error_detail
                    .as_deref()
                    .unwrap_or("-")
                    .replace('\n', " ");
                out.push_str(&format!(
                    "  {}  {}  {}  {}\n",
                    job.id,
                    job.kind,
                    format_duration(job.elapsed()),
                    truncate(&detail, 120)
                ));
            }
        }

        out
    }
}

/// Format an elapsed duration for the report
fn format_duration(d: Duration) -> String {
    let hours = d.num_hours();
    let minutes = d.num_minutes() % 60;
    let seconds = d.num_seconds() % 60;
    format!("{}h {}m {}s", hours, minutes, seconds)
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServiceConfig {
        ServiceConfig {
            output_tail_bytes: 4096,
            event_capacity: 64,
            ..ServiceConfig::default_config()
        }
    }

    fn seeded_record(id: &str, state: JobState, finished_secs_ago: Option<i64>) -> JobRecord {
        let mut record = JobRecord::new(
            id.to_string(),
            format!("https://example.com/{}", id),
            JobKind::Video,
            None,
        );
        record.state = state;
        if let Some(secs) = finished_secs_ago {
            record.finished_at = Some(Utc::now() - Duration::seconds(secs));
        }
        record
    }

    async fn wait_terminal(manager: &JobManager, id: &str) -> JobRecord {
        for _ in 0..200 {
            if let Some(record) = manager.get_job(id) {
                if record.state.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("job {} did not reach a terminal state in time", id);
    }

    #[tokio::test]
    async fn test_progress_events_then_completion() {
        let manager = JobManager::new(test_config());
        let mut events = manager.subscribe();
        let id = manager.generate_id();
        manager
            .start_job(
                id.clone(),
                "https://example.com/watch?v=abc".to_string(),
                JobKind::Video,
                "sh".to_string(),
                vec![
                    "-c".to_string(),
                    "printf '10%%\\n55%%\\n100%%\\n'".to_string(),
                ],
                None,
            )
            .unwrap();

        let mut seen = Vec::new();
        let record = loop {
            let event =
                tokio::time::timeout(std::time::Duration::from_secs(10), events.recv())
                    .await
                    .expect("timed out waiting for events")
                    .expect("event channel closed");
            match event {
                JobEvent::Progress { percent, .. } => seen.push(percent.unwrap()),
                JobEvent::Completed(record) => break record,
                JobEvent::Failed(record) => {
                    panic!("job failed unexpectedly: {:?}", record.error_detail)
                }
            }
        };

        assert_eq!(seen, vec![10.0, 55.0, 100.0]);
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.progress_percent, Some(100.0));
        let finished = record.finished_at.expect("finished_at must be set");
        assert!(finished >= record.started_at);
    }

    #[tokio::test]
    async fn test_failed_job_captures_exit_code_and_output() {
        let manager = JobManager::new(test_config());
        let id = manager.generate_id();
        manager
            .start_job(
                id.clone(),
                "https://example.com/watch?v=gone".to_string(),
                JobKind::Video,
                "sh".to_string(),
                vec![
                    "-c".to_string(),
                    "echo 'no such host' >&2; exit 1".to_string(),
                ],
                None,
            )
            .unwrap();

        let record = wait_terminal(&manager, &id).await;
        assert_eq!(record.state, JobState::Failed);
        let detail = record.error_detail.expect("error detail must be set");
        assert!(detail.contains("code 1"), "detail: {}", detail);
        assert!(detail.contains("no such host"), "detail: {}", detail);
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_launch_failure_is_reported_through_the_record() {
        let manager = JobManager::new(test_config());
        let id = manager.generate_id();
        manager
            .start_job(
                id.clone(),
                "https://example.com/watch?v=abc".to_string(),
                JobKind::Audio,
                "/definitely/not/a/real/binary".to_string(),
                vec![],
                None,
            )
            .unwrap();

        let record = wait_terminal(&manager, &id).await;
        assert_eq!(record.state, JobState::Failed);
        let detail = record.error_detail.expect("error detail must be set");
        assert!(detail.contains("failed to launch"), "detail: {}", detail);
    }

    #[tokio::test]
    async fn test_started_job_is_immediately_queryable_and_active() {
        let manager = JobManager::new(test_config());
        let id = manager.generate_id();
        manager
            .start_job(
                id.clone(),
                "https://example.com/watch?v=abc".to_string(),
                JobKind::Video,
                "sleep".to_string(),
                vec!["30".to_string()],
                Some(PathBuf::from("/tmp/fetchd/out.mp4")),
            )
            .unwrap();

        let record = manager.get_job(&id).expect("record must exist immediately");
        assert!(!record.state.is_terminal());
        assert_eq!(
            record.expected_output_path,
            Some(PathBuf::from("/tmp/fetchd/out.mp4"))
        );
        assert!(manager.list_active().iter().any(|r| r.id == id));

        manager.cancel(&id).unwrap();
        let record = wait_terminal(&manager, &id).await;
        assert_eq!(record.state, JobState::Failed);
        assert!(!manager.list_active().iter().any(|r| r.id == id));
    }

    #[tokio::test]
    async fn test_cancel_kills_running_job() {
        let manager = JobManager::new(test_config());
        let id = manager.generate_id();
        manager
            .start_job(
                id.clone(),
                "https://example.com/watch?v=abc".to_string(),
                JobKind::Video,
                "sleep".to_string(),
                vec!["30".to_string()],
                None,
            )
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        manager.cancel(&id).unwrap();

        let record = wait_terminal(&manager, &id).await;
        assert_eq!(record.state, JobState::Failed);
        let detail = record.error_detail.expect("error detail must be set");
        assert!(detail.contains("cancelled"), "detail: {}", detail);

        // Cancelling again is an error: the job is already terminal.
        assert!(matches!(
            manager.cancel(&id),
            Err(Error::JobNotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_an_error() {
        let manager = JobManager::new(test_config());
        assert!(matches!(
            manager.cancel("nope"),
            Err(Error::UnknownJobId(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_stuck_job() {
        let mut cfg = test_config();
        cfg.job_timeout_secs = Some(1);
        let manager = JobManager::new(cfg);
        let id = manager.generate_id();
        manager
            .start_job(
                id.clone(),
                "https://example.com/watch?v=abc".to_string(),
                JobKind::Video,
                "sleep".to_string(),
                vec!["30".to_string()],
                None,
            )
            .unwrap();

        let record = wait_terminal(&manager, &id).await;
        assert_eq!(record.state, JobState::Failed);
        let detail = record.error_detail.expect("error detail must be set");
        assert!(detail.contains("timed out"), "detail: {}", detail);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let manager = JobManager::new(test_config());
        let id = manager.generate_id();
        manager
            .start_job(
                id.clone(),
                "https://example.com/a".to_string(),
                JobKind::Video,
                "sleep".to_string(),
                vec!["1".to_string()],
                None,
            )
            .unwrap();

        let second = manager.start_job(
            id.clone(),
            "https://example.com/b".to_string(),
            JobKind::Audio,
            "sleep".to_string(),
            vec!["1".to_string()],
            None,
        );
        assert!(matches!(second, Err(Error::DuplicateJobId(_))));

        // The original registration is untouched.
        let record = manager.get_job(&id).unwrap();
        assert_eq!(record.source_url, "https://example.com/a");

        wait_terminal(&manager, &id).await;
    }

    #[test]
    fn test_prune_removes_only_old_terminal_records() {
        let manager = JobManager::new(test_config());
        {
            let mut jobs = manager.jobs.lock().unwrap();
            jobs.insert(
                "old-done".to_string(),
                seeded_record("old-done", JobState::Completed, Some(7200)),
            );
            jobs.insert(
                "fresh-done".to_string(),
                seeded_record("fresh-done", JobState::Completed, Some(10)),
            );
            jobs.insert(
                "old-failed".to_string(),
                seeded_record("old-failed", JobState::Failed, Some(7200)),
            );
            jobs.insert(
                "still-running".to_string(),
                seeded_record("still-running", JobState::Running, None),
            );
        }

        let removed = manager.prune_older_than(Duration::seconds(3600));
        assert_eq!(removed, 2);
        assert!(manager.get_job("old-done").is_none());
        assert!(manager.get_job("old-failed").is_none());
        assert!(manager.get_job("fresh-done").is_some());
        assert!(manager.get_job("still-running").is_some());
    }

    #[test]
    fn test_prune_never_removes_active_records() {
        let manager = JobManager::new(test_config());
        {
            let mut jobs = manager.jobs.lock().unwrap();
            let mut ancient = seeded_record("ancient-run", JobState::Running, None);
            ancient.started_at = Utc::now() - Duration::days(365);
            jobs.insert("ancient-run".to_string(), ancient);
            jobs.insert(
                "waiting".to_string(),
                seeded_record("waiting", JobState::Pending, None),
            );
        }

        let removed = manager.prune_older_than(Duration::zero());
        assert_eq!(removed, 0);
        assert!(manager.get_job("ancient-run").is_some());
        assert!(manager.get_job("waiting").is_some());
    }

    #[test]
    fn test_summarize_with_no_jobs() {
        let manager = JobManager::new(test_config());
        let report = manager.summarize();
        assert_eq!(report, "No jobs.");
    }

    #[test]
    fn test_summarize_buckets_jobs_by_state() {
        let manager = JobManager::new(test_config());
        {
            let mut jobs = manager.jobs.lock().unwrap();
            jobs.insert(
                "job-active".to_string(),
                seeded_record("job-active", JobState::Running, None),
            );
            let mut done = seeded_record("job-done", JobState::Completed, Some(5));
            done.resolved_filename = Some("movie.mp4".to_string());
            jobs.insert("job-done".to_string(), done);
            let mut broken = seeded_record("job-broken", JobState::Failed, Some(5));
            broken.error_detail = Some("process exited with code 1; output tail:\nboom".to_string());
            jobs.insert("job-broken".to_string(), broken);
        }

        let report = manager.summarize();
        let active_at = report.find("Active:").expect("active section");
        let completed_at = report.find("Completed:").expect("completed section");
        let failed_at = report.find("Failed:").expect("failed section");

        let pos = |needle: &str| report.find(needle).unwrap_or_else(|| panic!("missing {}", needle));
        assert!(pos("job-active") > active_at && pos("job-active") < completed_at);
        assert!(pos("job-done") > completed_at && pos("job-done") < failed_at);
        assert!(pos("job-broken") > failed_at);
        assert!(report.contains("movie.mp4"));
        assert!(report.contains("boom"));
    }
}
