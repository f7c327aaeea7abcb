use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::command::CommandBuilder;
use crate::config::PipelineConfig;
use crate::error::ProbeError;
use crate::runner::{ExitCode, ProcessRunner, StreamKind};

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: Option<FFProbeFormat>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    pub index: u32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_rate: Option<String>,
    pub channels: Option<u32>,
    pub bit_rate: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

impl FFProbeStream {
    fn is(&self, codec_type: &str) -> bool {
        self.codec_type.as_deref() == Some(codec_type)
    }

    fn codec(&self) -> String {
        self.codec_name.clone().unwrap_or_else(|| "unknown".to_string())
    }

    fn tag(&self, key: &str) -> Option<String> {
        let tags = self.tags.as_ref()?;
        // Matroska writes lowercase keys, some muxers uppercase
        let value = tags.get(key).or_else(|| tags.get(&key.to_uppercase()))?;
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    /// Language tag, treating "und" as absent
    pub fn language(&self) -> Option<String> {
        self.tag("language")
            .map(|l| l.to_lowercase())
            .filter(|l| l != "und")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioTrack {
    /// Source-container stream index
    pub index: u32,
    pub codec: String,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
    pub language: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitleTrack {
    /// Source-container stream index
    pub index: u32,
    pub codec: String,
    pub language: Option<String>,
}

/// Track layout of a source file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInventory {
    /// Codec of the first video stream, if any
    pub video_codec: Option<String>,
    pub video_index: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
    /// Container bitrate in bits/s
    pub bit_rate: Option<u64>,
    pub audio_tracks: Vec<AudioTrack>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
}

impl StreamInventory {
    pub fn from_probe(data: &FFProbeData) -> Self {
        // Attached cover art shows up as a video stream; skip it
        let video = data
            .streams
            .iter()
            .find(|s| s.is("video") && s.codec_name.as_deref() != Some("mjpeg") && s.codec_name.as_deref() != Some("png"));

        let audio_tracks = data
            .streams
            .iter()
            .filter(|s| s.is("audio"))
            .map(|s| AudioTrack {
                index: s.index,
                codec: s.codec(),
                sample_rate: s.sample_rate.as_deref().and_then(|r| r.parse().ok()),
                channel_count: s.channels,
                language: s.language(),
                title: s.tag("title"),
            })
            .collect();

        let subtitle_tracks = data
            .streams
            .iter()
            .filter(|s| s.is("subtitle"))
            .map(|s| SubtitleTrack {
                index: s.index,
                codec: s.codec(),
                language: s.language(),
            })
            .collect();

        let format = data.format.as_ref();
        let duration_secs = format
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0);
        let bit_rate = format
            .and_then(|f| f.bit_rate.as_deref())
            .or_else(|| video.and_then(|v| v.bit_rate.as_deref()))
            .and_then(|b| b.parse::<u64>().ok())
            .filter(|b| *b > 0);

        StreamInventory {
            video_codec: video.map(|v| v.codec()),
            video_index: video.map(|v| v.index),
            width: video.and_then(|v| v.width),
            height: video.and_then(|v| v.height),
            duration_secs,
            bit_rate,
            audio_tracks,
            subtitle_tracks,
        }
    }
}

/// Parse ffprobe `-print_format json` output into an inventory
pub fn parse_inventory(json: &str, path: &Path) -> Result<StreamInventory, ProbeError> {
    let data: FFProbeData = serde_json::from_str(json).map_err(|source| ProbeError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(StreamInventory::from_probe(&data))
}

/// Runs ffprobe through a [`ProcessRunner`] and builds a [`StreamInventory`]
pub struct StreamProber {
    runner: Arc<dyn ProcessRunner>,
    cfg: PipelineConfig,
}

impl StreamProber {
    pub fn new(runner: Arc<dyn ProcessRunner>, cfg: PipelineConfig) -> Self {
        StreamProber { runner, cfg }
    }

    /// Inspect `path`. Read-only; never creates any output.
    pub async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<StreamInventory, ProbeError> {
        let spec = CommandBuilder::probe_command(&self.cfg, path)?;
        let mut handle = self.runner.run(spec, cancel.child_token())?;

        let mut stdout = String::new();
        let mut stderr = Vec::new();
        while let Some(line) = handle.next_line().await {
            match line.stream {
                StreamKind::Stdout => {
                    stdout.push_str(&line.text);
                    stdout.push('\n');
                }
                StreamKind::Stderr => stderr.push(line.text),
            }
        }

        let result = handle.wait().await;
        match result.code {
            ExitCode::Success => {}
            ExitCode::Cancelled => return Err(ProbeError::Cancelled),
            code => {
                return Err(ProbeError::Exit {
                    path: path.to_path_buf(),
                    code,
                    stderr: stderr.join("\n"),
                })
            }
        }

        let inventory = parse_inventory(&stdout, path)?;
        debug!(
            "Probed {}: video={:?} audio={} subtitles={}",
            path.display(),
            inventory.video_codec,
            inventory.audio_tracks.len(),
            inventory.subtitle_tracks.len()
        );
        Ok(inventory)
    }
}
