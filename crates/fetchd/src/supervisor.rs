use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::job::JobState;
use crate::manager::{CancelMap, JobEvent, JobStore};
use crate::progress::{self, ProgressSignal};

/// Interleaved stdout/stderr lines, bounded to roughly the most recent
/// `cap` bytes. Oldest lines are dropped first; a single line larger than
/// the cap is kept whole.
struct OutputTail {
    lines: VecDeque<String>,
    bytes: usize,
    cap: usize,
}

impl OutputTail {
    fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            cap,
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.cap && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            }
        }
    }

    fn join(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How the supervised process came to an end.
enum Outcome {
    Exited(std::process::ExitStatus),
    Cancelled,
    TimedOut,
    WaitFailed(std::io::Error),
}

/// Supervises one external process for one job: launches it, follows both
/// output streams, and drives the owning record through the state machine.
///
/// The supervisor is the single writer for its job's record; nothing else
/// mutates a record between registration and the terminal transition.
pub(crate) struct Supervisor {
    store: JobStore,
    cancels: CancelMap,
    events: broadcast::Sender<JobEvent>,
    output_tail_bytes: usize,
    timeout: Option<Duration>,
}

impl Supervisor {
    pub(crate) fn new(
        store: JobStore,
        cancels: CancelMap,
        events: broadcast::Sender<JobEvent>,
        output_tail_bytes: usize,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            store,
            cancels,
            events,
            output_tail_bytes,
            timeout,
        }
    }

    /// Run the job to its terminal state. Spawned as its own task; never
    /// returns an error because process failures are captured into the
    /// record rather than propagated.
    pub(crate) async fn run(
        self,
        id: String,
        command: String,
        args: Vec<String>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        debug!("Job {}: launching {} {:?}", id, command, args);

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Launch failure path: same terminal transition as an exit
                // failure, with the launch error in place of an exit code.
                self.finalize(&id, Err(format!("failed to launch {}: {}", command, e)));
                return;
            }
        };

        // The process is live: pending -> running, before any output is seen.
        self.mark_running(&id);

        let tail = Arc::new(Mutex::new(OutputTail::new(self.output_tail_bytes)));

        let mut readers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(stdout, id.clone(), Arc::clone(&tail)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(stderr, id.clone(), Arc::clone(&tail)));
        }

        let outcome = if let Some(limit) = self.timeout {
            tokio::select! {
                res = child.wait() => match res {
                    Ok(status) => Outcome::Exited(status),
                    Err(e) => Outcome::WaitFailed(e),
                },
                _ = &mut cancel_rx => Outcome::Cancelled,
                _ = tokio::time::sleep(limit) => Outcome::TimedOut,
            }
        } else {
            tokio::select! {
                res = child.wait() => match res {
                    Ok(status) => Outcome::Exited(status),
                    Err(e) => Outcome::WaitFailed(e),
                },
                _ = &mut cancel_rx => Outcome::Cancelled,
            }
        };

        if matches!(outcome, Outcome::Cancelled | Outcome::TimedOut) {
            if let Err(e) = child.kill().await {
                warn!("Job {}: failed to kill process: {}", id, e);
            }
        }

        // Let both stream readers drain whatever output is left.
        for reader in readers {
            let _ = reader.await;
        }

        let tail_text = tail.lock().unwrap().join();

        let result = match outcome {
            Outcome::Exited(status) if status.success() => Ok(()),
            Outcome::Exited(status) => {
                let code = status.code().unwrap_or(-1);
                Err(format!(
                    "process exited with code {}; output tail:\n{}",
                    code, tail_text
                ))
            }
            Outcome::Cancelled => Err("job cancelled; process killed".to_string()),
            Outcome::TimedOut => {
                let secs = self.timeout.map(|d| d.as_secs()).unwrap_or(0);
                Err(format!("job timed out after {}s; process killed", secs))
            }
            Outcome::WaitFailed(e) => Err(format!("failed waiting for process: {}", e)),
        };

        self.finalize(&id, result);
    }

    /// Follow one output stream line by line: record the tail and feed each
    /// line through the progress interpreter as its own chunk.
    fn spawn_reader<R>(&self, stream: R, id: String, tail: Arc<Mutex<OutputTail>>) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("Job {}: {}", id, line);
                let signal = progress::scan_chunk(&line);
                tail.lock().unwrap().push(line);
                if signal.is_empty() {
                    continue;
                }
                apply_signal(&store, &events, &id, signal);
            }
        })
    }

    fn mark_running(&self, id: &str) {
        let mut jobs = self.store.lock().unwrap();
        if let Some(record) = jobs.get_mut(id) {
            if record.state == JobState::Pending {
                record.state = JobState::Running;
            }
        }
    }

    /// Drive the record to its terminal state, drop the cancellation handle,
    /// and notify subscribers. The state write happens inside one lock
    /// scope, so the job leaves the active view at the same instant it
    /// becomes terminal.
    fn finalize(&self, id: &str, result: Result<(), String>) {
        let record = {
            let mut jobs = self.store.lock().unwrap();
            let Some(record) = jobs.get_mut(id) else {
                warn!("Job {}: record vanished before finalization", id);
                return;
            };
            record.finished_at = Some(Utc::now());
            match result {
                Ok(()) => {
                    record.state = JobState::Completed;
                    record.progress_percent = Some(100.0);
                }
                Err(detail) => {
                    record.state = JobState::Failed;
                    record.error_detail = Some(detail);
                }
            }
            record.clone()
        };
        self.cancels.lock().unwrap().remove(id);

        if record.state == JobState::Completed {
            info!(
                "✅ Job {} completed in {}s",
                id,
                record.elapsed().num_seconds()
            );
            let _ = self.events.send(JobEvent::Completed(record));
        } else {
            warn!(
                "❌ Job {} failed: {}",
                id,
                record.error_detail.as_deref().unwrap_or("unknown")
            );
            let _ = self.events.send(JobEvent::Failed(record));
        }
    }
}

/// Apply one extracted signal to the owning record and notify subscribers.
/// Signals arriving after the job left `running` are ignored.
fn apply_signal(
    store: &JobStore,
    events: &broadcast::Sender<JobEvent>,
    id: &str,
    signal: ProgressSignal,
) {
    {
        let mut jobs = store.lock().unwrap();
        let Some(record) = jobs.get_mut(id) else {
            return;
        };
        if record.state != JobState::Running {
            return;
        }
        if let Some(percent) = signal.percent {
            record.progress_percent = Some(percent);
        }
        if let Some(ref filename) = signal.filename {
            record.resolved_filename = Some(filename.clone());
        }
    }
    let _ = events.send(JobEvent::Progress {
        id: id.to_string(),
        percent: signal.percent,
        filename: signal.filename,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_drops_oldest_lines_beyond_cap() {
        let mut tail = OutputTail::new(32);
        for i in 0..100 {
            tail.push(format!("line {:03}", i));
        }
        let text = tail.join();
        assert!(text.len() <= 32);
        assert!(text.contains("line 099"));
        assert!(!text.contains("line 000"));
    }

    #[test]
    fn test_tail_keeps_a_single_oversized_line() {
        let mut tail = OutputTail::new(8);
        tail.push("x".repeat(64));
        assert_eq!(tail.join().len(), 64);
    }

    #[test]
    fn test_tail_of_empty_output_is_empty() {
        assert_eq!(OutputTail::new(1024).join(), "");
    }
}
