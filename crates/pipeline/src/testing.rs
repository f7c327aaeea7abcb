//! Scripted process runner for exercising the pipeline without ffmpeg.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandSpec, UnitKind};
use crate::error::RunnerError;
use crate::runner::{ExitCode, ExitResult, OutputLine, ProcessHandle, ProcessRunner, StreamKind};

/// How a fake unit behaves
#[derive(Debug, Clone)]
pub struct Script {
    lines: Vec<OutputLine>,
    exit: ExitCode,
    hang: bool,
    delay: Duration,
    write_output: bool,
}

impl Script {
    pub fn ok() -> Self {
        Script {
            lines: Vec::new(),
            exit: ExitCode::Success,
            hang: false,
            delay: Duration::ZERO,
            write_output: true,
        }
    }

    pub fn fail(code: i32) -> Self {
        Script {
            exit: ExitCode::Failed(Some(code)),
            ..Script::ok()
        }
    }

    /// Runs until cancelled
    pub fn hang() -> Self {
        Script { hang: true, ..Script::ok() }
    }

    pub fn stdout(mut self, text: impl AsRef<str>) -> Self {
        self.push(StreamKind::Stdout, text.as_ref());
        self
    }

    pub fn stderr(mut self, text: impl AsRef<str>) -> Self {
        self.push(StreamKind::Stderr, text.as_ref());
        self
    }

    pub fn lines(mut self, lines: Vec<String>) -> Self {
        for line in lines {
            self.push(StreamKind::Stdout, &line);
        }
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Exit successfully without leaving the expected output behind
    pub fn no_output(mut self) -> Self {
        self.write_output = false;
        self
    }

    fn push(&mut self, stream: StreamKind, text: &str) {
        for line in text.lines() {
            self.lines.push(OutputLine {
                stream,
                text: line.to_string(),
            });
        }
    }
}

/// Records launches and final exit codes; unscripted units succeed immediately
#[derive(Default)]
pub struct FakeRunner {
    scripts: HashMap<UnitKind, Script>,
    launched: Arc<Mutex<Vec<UnitKind>>>,
    specs: Arc<Mutex<Vec<CommandSpec>>>,
    exits: Arc<Mutex<HashMap<UnitKind, ExitCode>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, unit: UnitKind, script: Script) -> Self {
        self.scripts.insert(unit, script);
        self
    }

    pub fn launched(&self) -> Arc<Mutex<Vec<UnitKind>>> {
        self.launched.clone()
    }

    /// Every command launched, in launch order
    pub fn specs(&self) -> Arc<Mutex<Vec<CommandSpec>>> {
        self.specs.clone()
    }

    pub fn exits(&self) -> Arc<Mutex<HashMap<UnitKind, ExitCode>>> {
        self.exits.clone()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, spec: CommandSpec, cancel: CancellationToken) -> Result<ProcessHandle, RunnerError> {
        let unit = spec.unit;
        let script = self.scripts.get(&unit).cloned().unwrap_or_else(Script::ok);
        self.launched.lock().unwrap().push(unit);
        self.specs.lock().unwrap().push(spec.clone());

        let (tx, rx) = mpsc::channel(256);
        let exits = self.exits.clone();
        let token = cancel.clone();

        let exit = tokio::spawn(async move {
            let started = Instant::now();
            for line in script.lines {
                if tx.send(line).await.is_err() {
                    break;
                }
            }

            let code = if script.hang {
                token.cancelled().await;
                ExitCode::Cancelled
            } else {
                tokio::select! {
                    _ = token.cancelled() => ExitCode::Cancelled,
                    _ = tokio::time::sleep(script.delay) => script.exit,
                }
            };

            if code.is_success() && script.write_output {
                if let Some(output) = &spec.output {
                    write_fake_output(output);
                }
            }
            exits.lock().unwrap().insert(unit, code);
            drop(tx);

            ExitResult {
                code,
                wall_clock: started.elapsed(),
            }
        });

        Ok(ProcessHandle::new(unit, rx, cancel, exit))
    }
}

fn write_fake_output(output: &Path) {
    if let Some(dir) = output.parent() {
        fs::create_dir_all(dir).unwrap();
    }
    if output.extension().and_then(|e| e.to_str()) == Some("vtt") {
        fs::write(output, "WEBVTT\n\n00:00.000 --> 00:01.000\nhello\n").unwrap();
    } else {
        fs::write(
            output,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:5\n#EXTINF:5.0,\nsegment0.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();
        if let Some(dir) = output.parent() {
            fs::write(dir.join("segment0.ts"), vec![0u8; 188]).unwrap();
        }
    }
}

/// ffprobe JSON for one 1080p video stream, then audio, then subtitle streams
pub fn probe_json(video_codec: &str, audio_codecs: &[&str], subtitle_codecs: &[&str]) -> String {
    let mut streams = vec![json!({
        "index": 0,
        "codec_type": "video",
        "codec_name": video_codec,
        "width": 1920,
        "height": 1080,
    })];
    let mut index = 1;
    for codec in audio_codecs {
        streams.push(json!({
            "index": index,
            "codec_type": "audio",
            "codec_name": codec,
            "sample_rate": "48000",
            "channels": 2,
        }));
        index += 1;
    }
    for codec in subtitle_codecs {
        streams.push(json!({
            "index": index,
            "codec_type": "subtitle",
            "codec_name": codec,
        }));
        index += 1;
    }

    json!({
        "streams": streams,
        "format": {
            "format_name": "matroska,webm",
            "duration": "120.500000",
            "bit_rate": "4000000",
        }
    })
    .to_string()
}
