use std::fmt;
use std::path::{Path, PathBuf};
use serde::Serialize;
use thiserror::Error;

use crate::bundle::BundleLayout;
use crate::config::PipelineConfig;
use crate::planner::{AudioPlan, SubtitlePlan, TrackAction, VideoPlan};

/// One independently supervised process within a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum UnitKind {
    Probe,
    Video,
    Audio(usize),
    Subtitle(usize),
}

impl UnitKind {
    pub fn is_video(&self) -> bool {
        matches!(self, UnitKind::Video)
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Probe => write!(f, "probe"),
            UnitKind::Video => write!(f, "video"),
            UnitKind::Audio(i) => write!(f, "audio_{}", i),
            UnitKind::Subtitle(i) => write!(f, "subtitle_{}", i),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("path is empty")]
    EmptyPath,
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),
    #[error("argument contains a NUL byte: {0:?}")]
    NulByte(String),
    #[error("output {output} escapes bundle root {root}")]
    OutsideBundle { output: PathBuf, root: PathBuf },
}

/// A fully validated external process invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub unit: UnitKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File the unit is expected to leave behind on success
    pub output: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(unit: UnitKind, program: impl Into<PathBuf>, args: Vec<String>) -> Result<Self, CommandError> {
        let program = program.into();
        path_arg(&program)?;
        for arg in &args {
            if arg.contains('\0') {
                return Err(CommandError::NulByte(arg.clone()));
            }
        }
        Ok(CommandSpec { unit, program, args, output: None })
    }

    fn with_output(mut self, output: PathBuf) -> Self {
        self.output = Some(output);
        self
    }

    /// Shell-quoted rendering for logs. Never executed through a shell.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .map(|a| shell_quote(&a))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Quote an argument for display the way a POSIX shell would need it
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,%+@".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn path_arg(path: &Path) -> Result<String, CommandError> {
    if path.as_os_str().is_empty() {
        return Err(CommandError::EmptyPath);
    }
    let s = path
        .to_str()
        .ok_or_else(|| CommandError::NonUtf8Path(path.to_path_buf()))?;
    if s.contains('\0') {
        return Err(CommandError::NulByte(s.to_string()));
    }
    Ok(s.to_string())
}

/// Builds ffprobe/ffmpeg invocations for one job.
///
/// Flag syntax is confined to this type so the runner stays tool-agnostic.
pub struct CommandBuilder<'a> {
    cfg: &'a PipelineConfig,
    layout: &'a BundleLayout,
    input: String,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(cfg: &'a PipelineConfig, layout: &'a BundleLayout, input: &Path) -> Result<Self, CommandError> {
        Ok(CommandBuilder {
            cfg,
            layout,
            input: path_arg(input)?,
        })
    }

    /// Probe command: stream and format metadata as JSON on stdout
    pub fn probe_command(cfg: &PipelineConfig, input: &Path) -> Result<CommandSpec, CommandError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            path_arg(input)?,
        ];
        CommandSpec::new(UnitKind::Probe, &cfg.ffprobe_bin, args)
    }

    fn input_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            self.input.clone(),
        ]
    }

    fn hls_output_args(&self, dir: &Path, playlist: &Path) -> Result<Vec<String>, CommandError> {
        self.inside_bundle(playlist)?;
        Ok(vec![
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            self.cfg.hls_segment_secs.to_string(),
            "-hls_list_size".to_string(),
            "0".to_string(),
            "-hls_playlist_type".to_string(),
            "vod".to_string(),
            "-hls_segment_filename".to_string(),
            path_arg(&BundleLayout::segment_pattern(dir))?,
            "-progress".to_string(),
            "pipe:1".to_string(),
            "-nostats".to_string(),
            path_arg(playlist)?,
        ])
    }

    fn inside_bundle(&self, output: &Path) -> Result<(), CommandError> {
        if output.starts_with(self.layout.root()) {
            Ok(())
        } else {
            Err(CommandError::OutsideBundle {
                output: output.to_path_buf(),
                root: self.layout.root().to_path_buf(),
            })
        }
    }

    /// Video unit: first video stream only, segmented into `video/`
    pub fn video(&self, plan: &VideoPlan) -> Result<CommandSpec, CommandError> {
        let mut args = self.input_args();

        args.push("-map".to_string());
        args.push(format!("0:{}", plan.source_index));

        args.push("-c:v".to_string());
        match plan.action {
            TrackAction::Copy => args.push("copy".to_string()),
            TrackAction::Transcode => {
                args.push("libx264".to_string());
                args.push("-preset".to_string());
                args.push(self.cfg.video_preset.clone());
                args.push("-crf".to_string());
                args.push(self.cfg.video_crf.to_string());
                args.push("-pix_fmt".to_string());
                args.push("yuv420p".to_string());
                // Keyframes on segment boundaries
                args.push("-force_key_frames".to_string());
                args.push(format!("expr:gte(t,n_forced*{})", self.cfg.hls_segment_secs));
            }
        }

        args.push("-an".to_string());
        args.push("-sn".to_string());

        let dir = self.layout.video_dir();
        let playlist = self.layout.video_playlist();
        args.extend(self.hls_output_args(&dir, &playlist)?);

        Ok(CommandSpec::new(UnitKind::Video, &self.cfg.ffmpeg_bin, args)?.with_output(playlist))
    }

    /// Audio unit: one source track into `audio_{i}/`
    pub fn audio(&self, plan: &AudioPlan) -> Result<CommandSpec, CommandError> {
        let mut args = self.input_args();

        args.push("-map".to_string());
        args.push(format!("0:{}", plan.source_index));

        args.push("-c:a".to_string());
        match plan.action {
            TrackAction::Copy => args.push("copy".to_string()),
            TrackAction::Transcode => {
                args.push(self.cfg.target_audio_codec.clone());
                args.push("-b:a".to_string());
                args.push(self.cfg.audio_bitrate.clone());
            }
        }

        args.push("-metadata:s:a:0".to_string());
        args.push(format!("language={}", plan.language));
        args.push("-vn".to_string());
        args.push("-sn".to_string());

        let dir = self.layout.audio_dir(plan.output_index);
        let playlist = self.layout.audio_playlist(plan.output_index);
        args.extend(self.hls_output_args(&dir, &playlist)?);

        Ok(CommandSpec::new(UnitKind::Audio(plan.output_index), &self.cfg.ffmpeg_bin, args)?
            .with_output(playlist))
    }

    /// Subtitle unit: one source track converted to a caption file
    pub fn subtitle(&self, plan: &SubtitlePlan) -> Result<CommandSpec, CommandError> {
        let mut args = self.input_args();

        args.push("-map".to_string());
        args.push(format!("0:{}", plan.source_index));
        args.push("-c:s".to_string());
        args.push(self.cfg.subtitle_format.clone());
        args.push("-vn".to_string());
        args.push("-an".to_string());
        args.push("-f".to_string());
        args.push(self.cfg.subtitle_format.clone());
        args.push("-progress".to_string());
        args.push("pipe:1".to_string());
        args.push("-nostats".to_string());

        let output = self.layout.subtitle_file(plan.output_index);
        self.inside_bundle(&output)?;
        args.push(path_arg(&output)?);

        Ok(CommandSpec::new(UnitKind::Subtitle(plan.output_index), &self.cfg.ffmpeg_bin, args)?
            .with_output(output))
    }
}
