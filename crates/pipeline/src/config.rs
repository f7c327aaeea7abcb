use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// What happens to the uploaded source file after a successful job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Leave the upload where the intake put it
    Keep,
    /// Move the upload into `retained_dir` as `{job_id}-{file_name}`
    Relocate,
}

/// Configuration for the HLS encoding pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Directory under which every job gets its own bundle root
    pub output_root: PathBuf,
    /// Directory where content records are stored as JSON files
    pub record_dir: PathBuf,
    /// Source retention after success
    pub retention: RetentionPolicy,
    /// Destination for relocated sources
    pub retained_dir: PathBuf,
    /// Video codecs that are segmented as-is instead of re-encoded
    pub copy_video_codecs: Vec<String>,
    /// Audio codec every HLS audio rendition must carry
    pub target_audio_codec: String,
    /// Caption format subtitles are converted to
    pub subtitle_format: String,
    /// Target HLS segment length in seconds
    pub hls_segment_secs: u32,
    /// Minimum interval between progress events for one unit
    pub progress_interval_ms: u64,
    /// Duration assumed for elapsed-time progress when ffmpeg never reports one
    pub expected_duration_secs: u64,
    /// Time a cancelled unit gets to exit after SIGTERM before it is killed
    pub cancel_grace_secs: u64,
    /// Languages handed out in order to audio tracks that carry no tag
    pub language_rotation: Vec<String>,
    /// BANDWIDTH advertised when the probe reports no bitrate (bits/s)
    pub default_bandwidth: u64,
    /// x264 preset used when video is transcoded
    pub video_preset: String,
    /// x264 CRF used when video is transcoded
    pub video_crf: u8,
    /// Bitrate for transcoded audio renditions (e.g. "160k")
    pub audio_bitrate: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl PipelineConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            output_root: PathBuf::from("downloads"),
            record_dir: PathBuf::from("records"),
            retention: RetentionPolicy::Keep,
            retained_dir: PathBuf::from("retained"),
            copy_video_codecs: vec!["h264".to_string()],
            target_audio_codec: "aac".to_string(),
            subtitle_format: "webvtt".to_string(),
            hls_segment_secs: 5,
            progress_interval_ms: 2000,
            expected_duration_secs: 600,
            cancel_grace_secs: 5,
            language_rotation: ["eng", "hin", "tam", "tel", "mal", "kan"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_bandwidth: 5_000_000,
            video_preset: "veryfast".to_string(),
            video_crf: 23,
            audio_bitrate: "160k".to_string(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Bundle root for a job: `{output_root}/{job_id}`
    pub fn bundle_root(&self, job_id: &str) -> PathBuf {
        self.output_root.join(job_id)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn expected_duration(&self) -> Duration {
        Duration::from_secs(self.expected_duration_secs.max(1))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}
