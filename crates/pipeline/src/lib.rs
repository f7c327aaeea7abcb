pub mod config;
pub mod error;
pub mod command;
pub mod bundle;
pub mod runner;
pub mod ffprobe;
pub mod planner;
pub mod progress;
pub mod playlist;
pub mod job;
pub mod store;
pub mod finalizer;
pub mod pipeline;
pub mod queue;

#[cfg(test)]
mod testing;

pub use config::{PipelineConfig, RetentionPolicy};
pub use error::{PipelineError, ProbeError, QueueError};
pub use ffprobe::{StreamInventory, StreamProber};
pub use job::{ChannelSink, Job, JobOutcome, JobRequest, JobState, LogSink, ProgressSink};
pub use planner::{EncodePlan, PlanPolicy, TrackAction};
pub use queue::{CancelOutcome, EncodeQueue, JobTicket};
pub use runner::{FfmpegRunner, ProcessRunner};
pub use store::{ContentRecord, FileMetadataStore, MetadataStore};
