use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::command::{CommandError, UnitKind};
use crate::runner::ExitCode;

/// Failure to launch or supervise an external process
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to capture {0} of child process")]
    Pipe(&'static str),
}

/// The source could not be inspected
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build ffprobe command: {0}")]
    Command(#[from] CommandError),
    #[error("failed to execute ffprobe: {0}")]
    Launch(#[from] RunnerError),
    #[error("ffprobe failed ({code}) for {path}: {stderr}")]
    Exit {
        path: PathBuf,
        code: ExitCode,
        stderr: String,
    },
    #[error("ffprobe was cancelled")]
    Cancelled,
    #[error("failed to parse ffprobe JSON for {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a single unit did not produce its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFailure {
    Exited(ExitCode),
    Launch(String),
    MissingOutput(PathBuf),
}

impl std::fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitFailure::Exited(code) => write!(f, "ffmpeg {}", code),
            UnitFailure::Launch(reason) => write!(f, "could not start ffmpeg: {}", reason),
            UnitFailure::MissingOutput(path) => write!(f, "expected output missing: {}", path.display()),
        }
    }
}

/// A unit that did not succeed, with the tail of its diagnostic output.
///
/// Whether it is fatal depends only on the unit: video failures end the job,
/// audio and subtitle failures drop the track.
#[derive(Debug, Clone, Error)]
#[error("{unit} unit failed: {failure}")]
pub struct UnitError {
    pub unit: UnitKind,
    pub failure: UnitFailure,
    pub tail: Vec<String>,
}

impl UnitError {
    pub fn is_fatal(&self) -> bool {
        self.unit.is_video()
    }

    pub fn was_cancelled(&self) -> bool {
        self.failure == UnitFailure::Exited(ExitCode::Cancelled)
    }

    /// Last few diagnostic lines, for user-facing failure messages
    pub fn excerpt(&self, lines: usize) -> String {
        let start = self.tail.len().saturating_sub(lines);
        self.tail[start..].join("\n")
    }
}

/// The master playlist could not be written
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("video playlist missing: {0}")]
    MissingVideoPlaylist(PathBuf),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Content record persistence failed
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode content record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("failed to persist content record: {0}")]
    Store(#[from] StoreError),
}

/// Job-terminal failure, as reported to the caller
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source file does not exist: {0}")]
    MissingSource(PathBuf),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("source has no video stream")]
    NoVideo,
    #[error("failed to prepare bundle directory {path}: {source}")]
    Bundle {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    FatalUnit(UnitError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
    #[error("job was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("encode queue is stopped")]
    Stopped,
}

impl PipelineError {
    /// Diagnostic excerpt worth showing to the caller, if any
    pub fn excerpt(&self) -> Option<String> {
        match self {
            PipelineError::FatalUnit(err) if !err.tail.is_empty() => Some(err.excerpt(5)),
            PipelineError::Probe(ProbeError::Exit { stderr, .. }) if !stderr.is_empty() => {
                let lines: Vec<&str> = stderr.lines().collect();
                let start = lines.len().saturating_sub(5);
                Some(lines[start..].join("\n"))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_video_failures_are_fatal() {
        let video = UnitError {
            unit: UnitKind::Video,
            failure: UnitFailure::Exited(ExitCode::Failed(Some(1))),
            tail: vec![],
        };
        let audio = UnitError {
            unit: UnitKind::Audio(1),
            failure: UnitFailure::Exited(ExitCode::Failed(Some(1))),
            tail: vec![],
        };
        let subtitle = UnitError {
            unit: UnitKind::Subtitle(0),
            failure: UnitFailure::Exited(ExitCode::Cancelled),
            tail: vec![],
        };
        assert!(video.is_fatal());
        assert!(!audio.is_fatal());
        assert!(!subtitle.is_fatal());
        assert!(subtitle.was_cancelled());
    }

    #[test]
    fn test_excerpt_takes_last_lines() {
        let err = UnitError {
            unit: UnitKind::Video,
            failure: UnitFailure::Exited(ExitCode::Failed(Some(1))),
            tail: (0..10).map(|i| format!("line {}", i)).collect(),
        };
        assert_eq!(err.excerpt(2), "line 8\nline 9");
        assert_eq!(PipelineError::FatalUnit(err).excerpt().unwrap().lines().count(), 5);
    }
}
