use anyhow::{Context, Result};
use clap::Parser;
use fetchd::{JobEvent, JobKind, JobManager, JobState, ServiceConfig};
use log::{error, info, warn};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;

/// Media fetch daemon: runs download jobs through the background job manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extract audio instead of fetching the full video
    #[arg(long)]
    audio: bool,

    /// Print the final job records as JSON after the report
    #[arg(long)]
    json: bool,

    /// Override the configured per-job timeout, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Media URLs to fetch
    #[arg(required = true)]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let mut cfg = ServiceConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if args.timeout_secs.is_some() {
        cfg.job_timeout_secs = args.timeout_secs;
    }

    info!("Fetch daemon starting");
    info!("  Downloader: {}", cfg.downloader_bin.display());
    info!("  Download dir: {}", cfg.download_dir.display());
    info!(
        "  Retention: {}s (sweep every {}s)",
        cfg.retention_secs, cfg.prune_interval_secs
    );

    std::fs::create_dir_all(&cfg.download_dir).with_context(|| {
        format!(
            "Failed to create download directory: {}",
            cfg.download_dir.display()
        )
    })?;

    let manager = JobManager::new(cfg.clone());
    manager.spawn_retention_sweep();

    let mut events = manager.subscribe();

    let kind = if args.audio {
        JobKind::Audio
    } else {
        JobKind::Video
    };
    let output_template = cfg.download_dir.join("%(title)s.%(ext)s");
    let command = cfg.downloader_bin.to_string_lossy().to_string();

    let mut pending: HashSet<String> = HashSet::new();
    for url in &args.urls {
        let id = manager.start_job(
            manager.generate_id(),
            url.clone(),
            kind,
            command.clone(),
            build_downloader_args(&output_template, url, args.audio),
            Some(output_template.clone()),
        )?;
        info!("Job {}: started for {}", id, url);
        pending.insert(id);
    }

    // Follow the event channel until every started job is terminal.
    while !pending.is_empty() {
        match events.recv().await {
            Ok(JobEvent::Progress {
                id,
                percent,
                filename,
            }) => {
                if let Some(pct) = percent {
                    info!("Job {}: {:.1}%", id, pct);
                }
                if let Some(name) = filename {
                    info!("Job {}: writing {}", id, name);
                }
            }
            Ok(JobEvent::Completed(record)) => {
                info!(
                    "✅ Job {} completed: {}",
                    record.id,
                    record.resolved_filename.as_deref().unwrap_or(&record.source_url)
                );
                pending.remove(&record.id);
            }
            Ok(JobEvent::Failed(record)) => {
                error!(
                    "❌ Job {} failed: {}",
                    record.id,
                    record.error_detail.as_deref().unwrap_or("unknown")
                );
                pending.remove(&record.id);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Event stream lagged, {} event(s) skipped", skipped);
                // Re-check for terminal transitions the lag may have hidden.
                pending.retain(|id| {
                    manager
                        .get_job(id)
                        .map(|r| !r.state.is_terminal())
                        .unwrap_or(false)
                });
            }
            Err(RecvError::Closed) => break,
        }
    }

    println!("{}", manager.summarize());

    if args.json {
        let records = manager.list_jobs();
        println!("{}", serde_json::to_string_pretty(&records)?);
    }

    let failed = manager
        .list_jobs()
        .iter()
        .filter(|r| r.state == JobState::Failed)
        .count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Assemble the minimal downloader invocation: line-buffered progress, no
/// playlist expansion, output template under the download directory. Format
/// selection and the rest of the argument surface belong to upstream layers.
fn build_downloader_args(output_template: &Path, url: &str, audio: bool) -> Vec<String> {
    let mut args = vec![
        "--newline".to_string(),
        "--no-playlist".to_string(),
        "-o".to_string(),
        output_template.to_string_lossy().to_string(),
    ];
    if audio {
        args.push("--extract-audio".to_string());
        args.push("--audio-format".to_string());
        args.push("mp3".to_string());
    }
    args.push(url.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_args_have_no_audio_extraction() {
        let args = build_downloader_args(Path::new("/tmp/fetchd/%(title)s.%(ext)s"), "https://example.com/v", false);
        assert_eq!(args.last().unwrap(), "https://example.com/v");
        assert!(!args.iter().any(|a| a == "--extract-audio"));
        assert!(args.windows(2).any(|w| w[0] == "-o" && w[1].contains("%(title)s")));
    }

    #[test]
    fn test_audio_args_request_extraction() {
        let args = build_downloader_args(Path::new("/tmp/fetchd/%(title)s.%(ext)s"), "https://example.com/a", true);
        assert!(args.iter().any(|a| a == "--extract-audio"));
        assert!(args.windows(2).any(|w| w[0] == "--audio-format" && w[1] == "mp3"));
        assert_eq!(args.last().unwrap(), "https://example.com/a");
    }
}
