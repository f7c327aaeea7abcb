use std::collections::HashSet;
use serde::Serialize;

use crate::config::PipelineConfig;
use crate::ffprobe::StreamInventory;

/// Image-based subtitle codecs that cannot be converted to a text caption format
const IMAGE_SUBTITLE_CODECS: &[&str] = &["hdmv_pgs_subtitle", "dvd_subtitle", "dvb_subtitle", "xsub"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackAction {
    /// Bitstream passthrough
    Copy,
    Transcode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoPlan {
    pub source_index: u32,
    pub action: TrackAction,
    /// Source codec
    pub codec: String,
    pub resolution: Option<(u32, u32)>,
    /// Advertised BANDWIDTH in bits/s
    pub bandwidth: u64,
    /// Container duration, when the probe reported one
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioPlan {
    pub source_index: u32,
    pub output_index: usize,
    pub action: TrackAction,
    pub language: String,
    /// Source codec
    pub codec: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitlePlan {
    pub source_index: u32,
    pub output_index: usize,
    pub language: Option<String>,
}

/// How each track of one source is handled
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodePlan {
    /// `None` when the source has no video; such a job cannot succeed
    pub video: Option<VideoPlan>,
    pub audio: Vec<AudioPlan>,
    pub subtitles: Vec<SubtitlePlan>,
}

impl EncodePlan {
    pub fn audio_outputs(&self) -> Vec<usize> {
        self.audio.iter().map(|a| a.output_index).collect()
    }

    /// Remove a failed audio track. Surviving tracks keep their output index,
    /// which is already baked into their directory names.
    pub fn drop_audio(&mut self, output_index: usize) {
        self.audio.retain(|a| a.output_index != output_index);
    }

    pub fn drop_subtitle(&mut self, output_index: usize) {
        self.subtitles.retain(|s| s.output_index != output_index);
    }
}

/// The configurable half of planning
#[derive(Debug, Clone)]
pub struct PlanPolicy {
    pub copy_video_codecs: Vec<String>,
    pub target_audio_codec: String,
    pub language_rotation: Vec<String>,
    pub default_bandwidth: u64,
}

impl PlanPolicy {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        PlanPolicy {
            copy_video_codecs: cfg.copy_video_codecs.clone(),
            target_audio_codec: cfg.target_audio_codec.clone(),
            language_rotation: cfg.language_rotation.clone(),
            default_bandwidth: cfg.default_bandwidth,
        }
    }

    fn copies_video(&self, codec: &str) -> bool {
        self.copy_video_codecs.iter().any(|c| c.eq_ignore_ascii_case(codec))
    }
}

/// Decide copy vs transcode per track and renumber outputs from zero. Pure.
pub fn plan(inventory: &StreamInventory, policy: &PlanPolicy) -> EncodePlan {
    let video = inventory
        .video_codec
        .as_ref()
        .zip(inventory.video_index)
        .map(|(codec, index)| VideoPlan {
            source_index: index,
            action: if policy.copies_video(codec) {
                TrackAction::Copy
            } else {
                TrackAction::Transcode
            },
            codec: codec.clone(),
            resolution: inventory.width.zip(inventory.height),
            bandwidth: inventory.bit_rate.unwrap_or(policy.default_bandwidth),
            duration_secs: inventory.duration_secs,
        });

    let mut languages = LanguageRotation::new(&policy.language_rotation, inventory);
    let audio = inventory
        .audio_tracks
        .iter()
        .enumerate()
        .map(|(output_index, track)| AudioPlan {
            source_index: track.index,
            output_index,
            action: if track.codec.eq_ignore_ascii_case(&policy.target_audio_codec) {
                TrackAction::Copy
            } else {
                TrackAction::Transcode
            },
            language: track.language.clone().unwrap_or_else(|| languages.next()),
            codec: track.codec.clone(),
            title: track.title.clone(),
        })
        .collect();

    let subtitles = inventory
        .subtitle_tracks
        .iter()
        .filter(|t| !IMAGE_SUBTITLE_CODECS.contains(&t.codec.as_str()))
        .enumerate()
        .map(|(output_index, track)| SubtitlePlan {
            source_index: track.index,
            output_index,
            language: track.language.clone(),
        })
        .collect();

    EncodePlan { video, audio, subtitles }
}

/// Hands out placeholder languages for untagged audio, skipping any already in use
struct LanguageRotation<'a> {
    table: &'a [String],
    next: usize,
    used: HashSet<String>,
    fallback: usize,
}

impl<'a> LanguageRotation<'a> {
    fn new(table: &'a [String], inventory: &StreamInventory) -> Self {
        let used = inventory
            .audio_tracks
            .iter()
            .filter_map(|t| t.language.clone())
            .collect();
        LanguageRotation { table, next: 0, used, fallback: 0 }
    }

    fn next(&mut self) -> String {
        while self.next < self.table.len() {
            let candidate = self.table[self.next].clone();
            self.next += 1;
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
        // Rotation exhausted: still unique, just not a real language
        loop {
            let candidate = format!("und{}", self.fallback);
            self.fallback += 1;
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}
