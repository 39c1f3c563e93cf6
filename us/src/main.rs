//! us - upload scheduler CLI
//!
//! Submits files as upload jobs to an in-process scheduler and reports how
//! each one ended.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use eyre::{Context, Result, eyre};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use uploadsched::cli::{Cli, Command, OutputFormat};
use uploadsched::config::{Config, LoggingConfig};
use uploadsched::domain::{JobId, JobStatus, Payload, Priority};
use uploadsched::events::{EventKind, JobEvent, spawn_event_logger};
use uploadsched::line_count::LineCountProcessor;
use uploadsched::scheduler::{ConflictResolution, JobRequest, Scheduler, Statistics};

fn setup_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = logging.log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: --verbose > config file > default (INFO)
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        match logging.level.as_deref() {
            Some(s) => s.parse::<tracing::Level>().unwrap_or_else(|_| {
                eprintln!("Warning: Unknown log level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }),
            None => tracing::Level::INFO,
        }
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = Config::load_logging(cli.config.as_ref());
    setup_logging(cli.verbose, &logging).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Some(Command::Run {
            files,
            group,
            priority,
            conflict,
            fail_first,
            fail_rate,
            timeout_ms,
            events_log,
            format,
        }) => {
            debug!(files = files.len(), ?group, ?priority, "main: matched Run command");
            let args = RunArgs {
                files,
                group,
                priority,
                conflict,
                fail_first,
                fail_rate,
                timeout: timeout_ms.map(Duration::from_millis),
                events_log,
                format,
            };
            cmd_run(&config, args).await
        }
        Some(Command::Config { format }) => {
            debug!(?format, "main: matched Config command");
            cmd_config(&config, format)
        }
        None => {
            debug!("main: no command specified, printing help");
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

struct RunArgs {
    files: Vec<PathBuf>,
    group: Option<String>,
    priority: Option<Priority>,
    conflict: Option<ConflictResolution>,
    fail_first: u32,
    fail_rate: f64,
    timeout: Option<Duration>,
    events_log: Option<PathBuf>,
    format: OutputFormat,
}

/// How one submitted file ended
#[derive(Debug, Serialize)]
struct JobOutcome {
    file: PathBuf,
    id: Option<JobId>,
    status: Option<JobStatus>,
    attempts: u32,
    result: Option<Value>,
    error: Option<String>,
}

impl JobOutcome {
    fn succeeded(&self) -> bool {
        self.status == Some(JobStatus::Completed)
    }
}

#[derive(Serialize)]
struct RunReport {
    jobs: Vec<JobOutcome>,
    statistics: Statistics,
}

/// Group key for a file: its parent directory name
fn default_group(file: &Path) -> String {
    file.parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_string())
}

/// Submit every file, wait for all of them and report
async fn cmd_run(config: &Config, args: RunArgs) -> Result<()> {
    debug!(files = args.files.len(), "cmd_run: called");
    let processor = LineCountProcessor::new()
        .with_fail_first(args.fail_first)
        .with_fail_rate(args.fail_rate);
    let scheduler =
        Scheduler::new(config.scheduler.clone(), Arc::new(processor)).context("Failed to create scheduler")?;

    let events = scheduler.events();
    let logger = match &args.events_log {
        Some(path) => Some(spawn_event_logger(&events, path).context("Failed to open event log")?),
        None => None,
    };
    let printer = (args.format == OutputFormat::Text)
        .then(|| events.spawn_listener(|e| !matches!(e.kind, EventKind::Progress { .. }), print_event));
    drop(events);

    let mut outcomes = Vec::new();
    let mut submitted = Vec::new();
    for file in &args.files {
        let data = fs::read(file).context(format!("Failed to read {}", file.display()))?;
        let group = args.group.clone().unwrap_or_else(|| default_group(file));
        let payload = Payload::from_bytes(data).with_file_name(file.display().to_string());

        let mut request = JobRequest::new(payload, group);
        if let Some(priority) = args.priority {
            request = request.with_priority(priority);
        }
        if let Some(conflict) = args.conflict {
            request = request.with_conflict_resolution(conflict);
        }
        if let Some(timeout) = args.timeout {
            request = request.with_timeout(timeout);
        }

        match scheduler.submit(request).await {
            Ok(receipt) => {
                debug!(id = %receipt.id, status = %receipt.status, file = %file.display(), "cmd_run: submitted");
                submitted.push((file.clone(), receipt.id));
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "cmd_run: submission rejected");
                outcomes.push(JobOutcome {
                    file: file.clone(),
                    id: None,
                    status: None,
                    attempts: 0,
                    result: None,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    let waits = submitted.iter().map(|(_, id)| scheduler.wait(id));
    let results = futures::future::join_all(waits).await;

    for ((file, id), result) in submitted.into_iter().zip(results) {
        let snapshot = scheduler.status(&id).await;
        let (result, error) = match result {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e.to_string())),
        };
        outcomes.push(JobOutcome {
            file,
            status: snapshot.as_ref().map(|s| s.status),
            attempts: snapshot.as_ref().map(|s| s.attempt).unwrap_or_default(),
            id: Some(id),
            result,
            error,
        });
    }

    let statistics = scheduler.statistics().await;
    scheduler.shutdown().await;
    drop(scheduler);

    // Let the sinks drain what is already on the bus
    if let Some(printer) = printer {
        let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    }
    if let Some(logger) = logger {
        let _ = tokio::time::timeout(Duration::from_secs(1), logger).await;
    }

    let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
    let total = outcomes.len();
    let report = RunReport {
        jobs: outcomes,
        statistics,
    };
    print_report(&report, args.format)?;

    if failed > 0 {
        return Err(eyre!("{} of {} jobs did not complete", failed, total));
    }
    Ok(())
}

fn print_event(event: JobEvent) {
    let id: String = event.job_id.chars().take(13).collect();
    let label = format!("{:>16}", event.event_type());
    let label = match event.kind {
        EventKind::Completed { .. } => label.green(),
        EventKind::Failed { .. } => label.red(),
        EventKind::RetryScheduled { .. } => label.yellow(),
        EventKind::Cancelled { .. } | EventKind::CancelRequested | EventKind::Conflict { .. } => label.magenta(),
        _ => label.cyan(),
    };
    let detail = match &event.kind {
        EventKind::Queued {
            group_key,
            priority,
            position,
            ..
        } => format!("group={} priority={} position={:?}", group_key, priority, position),
        EventKind::Conflict { conflicting_with, .. } => format!("conflicts with {:?}", conflicting_with),
        EventKind::Started { group_key, attempt } => format!("group={} attempt={}", group_key, attempt),
        EventKind::Progress { percent, stage, .. } => format!("{:.0}% {}", percent, stage),
        EventKind::RetryScheduled {
            attempt,
            delay_ms,
            error,
        } => format!("attempt {} failed: {} (retry in {}ms)", attempt, error, delay_ms),
        EventKind::Completed { attempts, duration_ms } => format!("after {} attempt(s), {}ms", attempts, duration_ms),
        EventKind::Failed { attempts, error } => format!("after {} attempt(s): {}", attempts, error),
        EventKind::CancelRequested => String::new(),
        EventKind::Cancelled { attempts } => format!("after {} attempt(s)", attempts),
    };
    println!("{} {} {}", label, id.dimmed(), detail);
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(report)?);
        }
        OutputFormat::Text => {
            println!();
            for job in &report.jobs {
                let status = job
                    .status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "rejected".to_string());
                let marker = if job.succeeded() { "✓".green() } else { "✗".red() };
                match (&job.result, &job.error) {
                    (Some(result), _) => println!("{} {} [{}] {}", marker, job.file.display(), status, result),
                    (None, Some(error)) => println!("{} {} [{}] {}", marker, job.file.display(), status, error),
                    (None, None) => println!("{} {} [{}]", marker, job.file.display(), status),
                }
            }

            let stats = &report.statistics;
            println!();
            println!("Upload Scheduler Statistics");
            println!("---------------------------");
            println!("Finished jobs: {}", stats.completed.total);
            println!("  Successful: {}", stats.completed.successful);
            println!("  Failed:     {}", stats.completed.failed);
            println!("  Cancelled:  {}", stats.completed.cancelled);
            println!("Success rate:  {:.1}%", stats.performance.success_rate * 100.0);
            println!("Total retries: {}", stats.performance.total_retries);
            if let Some(avg) = stats.performance.average_duration_ms {
                println!("Avg duration:  {}ms", avg);
            }
            println!("Peak running:  {}", stats.processing.peak);
            if let Some(bytes) = stats.memory.resident_bytes {
                println!("Memory:        {} MB", bytes / 1024 / 1024);
            }
        }
    }
    Ok(())
}

/// Print the effective configuration
fn cmd_config(config: &Config, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_config: called");
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Yaml | OutputFormat::Text => print!("{}", serde_yaml::to_string(config)?),
    }
    Ok(())
}
