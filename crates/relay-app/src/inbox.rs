//! Inbound mail spool. An external fetcher drops one JSON file per message
//! (`{"from", "subject", "body"}`) into the inbox; each intake pass feeds
//! them through the [`IntakePipeline`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use relay_core::CoreError;
use relay_dedup::{InboundMessage, IntakeOutcome, IntakePipeline};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const PROCESSED_DIR: &str = "processed";
const REJECTED_DIR: &str = "rejected";

#[derive(Debug, Deserialize)]
struct SpooledMessage {
    from: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub created: usize,
    pub duplicates: usize,
    pub ignored: usize,
    /// Left in the inbox for the next pass.
    pub retry: usize,
    pub unreadable: usize,
}

#[derive(Debug, Clone)]
pub struct InboxSpool {
    directory: PathBuf,
}

impl InboxSpool {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    async fn pending_files(&self) -> Result<Vec<PathBuf>, CoreError> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|error| io_failure("create inbox", &self.directory, error))?;
        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .map_err(|error| io_failure("list inbox", &self.directory, error))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| io_failure("list inbox", &self.directory, error))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read(&self, path: &Path) -> Option<InboundMessage> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "inbound message unreadable");
                return None;
            }
        };
        match serde_json::from_str::<SpooledMessage>(&raw) {
            Ok(spooled) => Some(InboundMessage {
                from: spooled.from,
                subject: spooled.subject,
                body: spooled.body,
            }),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "inbound message is not valid JSON");
                None
            }
        }
    }

    async fn move_into(&self, path: &Path, folder: &str) -> Result<(), CoreError> {
        let target_dir = self.directory.join(folder);
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|error| io_failure("create", &target_dir, error))?;
        let Some(file_name) = path.file_name() else {
            return Ok(());
        };
        let target = target_dir.join(file_name);
        tokio::fs::rename(path, &target)
            .await
            .map_err(|error| io_failure("move", path, error))
    }
}

fn io_failure(action: &str, path: &Path, error: std::io::Error) -> CoreError {
    CoreError::DependencyUnavailable(format!("failed to {action} {}: {error}", path.display()))
}

/// Feeds every spooled message through the pipeline once. Messages whose
/// ticket could not be created stay in the inbox. An `Err` from the pipeline
/// ends the pass early, leaving the current message in place.
pub async fn run_intake_pass(
    pipeline: &IntakePipeline,
    spool: &InboxSpool,
) -> Result<IntakeReport, CoreError> {
    let mut report = IntakeReport::default();

    for path in spool.pending_files().await? {
        let Some(message) = spool.read(&path).await else {
            report.unreadable += 1;
            spool.move_into(&path, REJECTED_DIR).await?;
            continue;
        };

        match pipeline.process(&message).await? {
            IntakeOutcome::CreationFailed { .. } => {
                report.retry += 1;
                continue;
            }
            IntakeOutcome::Created { .. } => report.created += 1,
            IntakeOutcome::Duplicate { .. } => report.duplicates += 1,
            IntakeOutcome::Ignored { .. } | IntakeOutcome::Rejected { .. } => report.ignored += 1,
        }
        spool.move_into(&path, PROCESSED_DIR).await?;
    }

    if report != IntakeReport::default() {
        info!(
            created = report.created,
            duplicates = report.duplicates,
            ignored = report.ignored,
            retry = report.retry,
            unreadable = report.unreadable,
            "intake pass finished"
        );
    }
    Ok(report)
}

/// Runs intake passes every `interval` until the stop channel flips.
pub fn spawn_intake_loop(
    pipeline: Arc<IntakePipeline>,
    spool: InboxSpool,
    interval: Duration,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(error) = run_intake_pass(&pipeline, &spool).await {
                error!(error = %error, "intake pass failed");
            }
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("intake stopped");
    })
}
