//! Event Logger - appends events to a JSONL file
//!
//! The EventLogger subscribes to the EventBus and writes each event as one
//! JSON line. External code can tail or ship the file to forward
//! notifications beyond the process.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::types::JobEvent;

/// Event logger that writes events to a JSONL file
pub struct EventLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl EventLogger {
    /// Open (or create) the log file for appending
    pub fn open(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::open: opening event log");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event as a JSON line
    pub fn write_event(&mut self, event: &JobEvent) -> eyre::Result<()> {
        debug!(job_id = %event.job_id, event_type = event.event_type(), "EventLogger::write_event");
        let json = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Run the logger, consuming events from the bus until it closes
    ///
    /// This is meant to be spawned as a background task.
    pub async fn run(mut self, event_bus: Arc<EventBus>) {
        self.run_with(event_bus.subscribe()).await;
    }

    async fn run_with(&mut self, mut rx: mpsc::UnboundedReceiver<JobEvent>) {
        debug!(path = ?self.path, "EventLogger::run: starting event logger");
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.write_event(&event) {
                error!(job_id = %event.job_id, error = %e, "EventLogger: failed to write event");
            }
        }
        debug!("EventLogger: bus closed, shutting down");
        let _ = self.writer.flush();
    }
}

/// Read events back from a JSONL log, skipping lines that don't parse
pub fn read_events(path: impl AsRef<Path>) -> eyre::Result<Vec<JobEvent>> {
    let path = path.as_ref();
    debug!(?path, "read_events: reading log file");

    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let mut events = Vec::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JobEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(line, error = %e, "read_events: failed to parse line");
            }
        }
    }

    debug!(count = events.len(), "read_events: loaded events");
    Ok(events)
}

/// Spawn the event logger as a background task
///
/// The returned subscription starts before this function returns, so no
/// event emitted afterwards is missed.
pub fn spawn_event_logger(event_bus: &EventBus, path: impl AsRef<Path>) -> eyre::Result<tokio::task::JoinHandle<()>> {
    let mut logger = EventLogger::open(path)?;
    let rx = event_bus.subscribe();
    Ok(tokio::spawn(async move {
        logger.run_with(rx).await;
    }))
}
