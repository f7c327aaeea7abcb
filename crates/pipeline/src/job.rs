use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Cells in a rendered progress bar
const BAR_CELLS: usize = 20;

/// Where a job reports human-readable status. Owned by the caller.
pub trait ProgressSink: Send + Sync {
    fn report(&self, text: &str);
}

/// Forwards every report into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn report(&self, text: &str) {
        // Caller stopped listening; the job carries on regardless
        let _ = self.tx.send(text.to_string());
    }
}

/// Sends reports to the log at info level
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, text: &str) {
        for line in text.lines() {
            info!("{}", line);
        }
    }
}

/// What a caller submits
#[derive(Clone)]
pub struct JobRequest {
    pub source_path: PathBuf,
    pub display_name: String,
    /// Key the intake deduplicates on; stored with the content record
    pub asset_key: Option<String>,
    pub sink: Arc<dyn ProgressSink>,
}

impl JobRequest {
    pub fn new(source_path: impl Into<PathBuf>, display_name: impl Into<String>, sink: Arc<dyn ProgressSink>) -> Self {
        JobRequest {
            source_path: source_path.into(),
            display_name: display_name.into(),
            asset_key: None,
            sink,
        }
    }

    pub fn with_asset_key(mut self, key: impl Into<String>) -> Self {
        self.asset_key = Some(key.into());
        self
    }
}

/// One transcode request. Immutable once created.
#[derive(Clone)]
pub struct Job {
    pub id: String,
    pub source_path: PathBuf,
    pub display_name: String,
    pub asset_key: Option<String>,
    pub sink: Arc<dyn ProgressSink>,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Job {
            id: Uuid::new_v4().simple().to_string(),
            source_path: request.source_path,
            display_name: request.display_name,
            asset_key: request.asset_key,
            sink: request.sink,
            enqueued_at: Utc::now(),
        }
    }

    pub fn report(&self, text: &str) {
        self.sink.report(text);
    }

    /// Key stored with the content record: the intake's key, else the file name
    pub fn asset_key(&self) -> String {
        self.asset_key.clone().unwrap_or_else(|| {
            self.source_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| self.id.clone())
        })
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("source_path", &self.source_path)
            .field("display_name", &self.display_name)
            .field("asset_key", &self.asset_key)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Probing,
    Planning,
    Encoding,
    Composing,
    Finalizing,
    Succeeded,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Probing => "probing",
            JobState::Planning => "planning",
            JobState::Encoding => "encoding",
            JobState::Composing => "composing",
            JobState::Finalizing => "finalizing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A track that did not make it into the bundle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedTrack {
    pub unit: String,
    pub reason: String,
}

/// Terminal result of one job, broadcast to queue subscribers
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub display_name: String,
    pub state: JobState,
    /// Public token of the content record, on success
    pub token: Option<String>,
    pub bundle_root: Option<PathBuf>,
    pub bundle_bytes: Option<u64>,
    pub error: Option<String>,
    pub dropped: Vec<DroppedTrack>,
}

impl JobOutcome {
    pub fn failed(job: &Job, error: impl Into<String>) -> Self {
        JobOutcome {
            job_id: job.id.clone(),
            display_name: job.display_name.clone(),
            state: JobState::Failed,
            token: None,
            bundle_root: None,
            bundle_bytes: None,
            error: Some(error.into()),
            dropped: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

/// `[██████░░░░░░░░░░░░░░]`, one cell per 5%
pub fn progress_bar(percent: u8) -> String {
    let percent = percent.min(100) as usize;
    let filled = percent * BAR_CELLS / 100;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(BAR_CELLS - filled))
}
