use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bundle::BundleLayout;
use crate::command::{CommandBuilder, CommandSpec, UnitKind};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, ProbeError, UnitError, UnitFailure};
use crate::ffprobe::StreamProber;
use crate::finalizer::{Committed, Finalizer};
use crate::job::{progress_bar, DroppedTrack, Job, JobOutcome, JobState};
use crate::planner::{self, PlanPolicy};
use crate::playlist::{self, MasterPlaylist};
use crate::progress::{track_unit, ProgressEvent, ProgressTracker};
use crate::runner::ProcessRunner;
use crate::store::MetadataStore;

/// What happened to an optional audio or subtitle track
#[derive(Debug, Clone, PartialEq)]
pub enum TrackOutcome {
    Kept,
    Dropped(String),
}

impl TrackOutcome {
    fn from_result(result: &Result<(), UnitError>) -> Self {
        match result {
            Ok(()) => TrackOutcome::Kept,
            Err(err) => TrackOutcome::Dropped(err.failure.to_string()),
        }
    }
}

struct Published {
    master: MasterPlaylist,
    committed: Committed,
    bundle_root: PathBuf,
}

/// Runs one job end to end: probe, plan, encode, compose, finalize or roll back
pub struct Pipeline {
    config: PipelineConfig,
    runner: Arc<dyn ProcessRunner>,
    prober: StreamProber,
    finalizer: Finalizer,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, runner: Arc<dyn ProcessRunner>, store: Arc<dyn MetadataStore>) -> Self {
        let prober = StreamProber::new(runner.clone(), config.clone());
        let finalizer = Finalizer::new(store, &config);
        Pipeline {
            config,
            runner,
            prober,
            finalizer,
        }
    }

    /// Run `job` to a terminal state. Never panics on job errors; every failure
    /// removes the job's bundle and leaves the source alone.
    pub async fn run(&self, job: &Job, cancel: &CancellationToken, state: &watch::Sender<JobState>) -> JobOutcome {
        let layout = BundleLayout::new(self.config.bundle_root(&job.id));
        let mut dropped = Vec::new();
        let started = Instant::now();

        match self.execute(job, &layout, cancel, state, &mut dropped).await {
            Ok(published) => {
                state.send_replace(JobState::Succeeded);
                info!(
                    "✅ Job {} completed in {:.1}s: {} ({} audio, {} subtitles)",
                    job.id,
                    started.elapsed().as_secs_f64(),
                    published.master.path.display(),
                    published.master.audio_renditions,
                    published.master.subtitle_renditions
                );
                job.report(&success_message(job, &published, &dropped));

                JobOutcome {
                    job_id: job.id.clone(),
                    display_name: job.display_name.clone(),
                    state: JobState::Succeeded,
                    token: Some(published.committed.token),
                    bundle_root: Some(published.bundle_root),
                    bundle_bytes: Some(published.committed.bundle_bytes),
                    error: None,
                    dropped,
                }
            }
            Err(err) => {
                error!("❌ Job {} failed: {}", job.id, err);
                self.finalizer.rollback(job, &layout);
                state.send_replace(JobState::Failed);
                job.report(&failure_message(&err));

                let mut outcome = JobOutcome::failed(job, err.to_string());
                outcome.dropped = dropped;
                outcome
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        layout: &BundleLayout,
        cancel: &CancellationToken,
        state: &watch::Sender<JobState>,
        dropped: &mut Vec<DroppedTrack>,
    ) -> Result<Published, PipelineError> {
        if !job.source_path.is_file() {
            return Err(PipelineError::MissingSource(job.source_path.clone()));
        }

        state.send_replace(JobState::Probing);
        info!("Job {}: 🔍 Probing {}", job.id, job.source_path.display());
        let inventory = match self.prober.probe(&job.source_path, cancel).await {
            Err(ProbeError::Cancelled) => return Err(PipelineError::Cancelled),
            other => other?,
        };

        state.send_replace(JobState::Planning);
        let mut plan = planner::plan(&inventory, &PlanPolicy::from_config(&self.config));
        let video = plan.video.clone().ok_or(PipelineError::NoVideo)?;
        info!(
            "Job {}: video {} ({:?}), {} audio track(s), {} subtitle track(s)",
            job.id,
            video.codec,
            video.action,
            plan.audio.len(),
            plan.subtitles.len()
        );
        for a in &plan.audio {
            debug!(
                "Job {}: audio {} <- stream {} ({}, {:?}, {})",
                job.id, a.output_index, a.source_index, a.codec, a.action, a.language
            );
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        layout
            .claim()
            .and_then(|()| layout.prepare(&plan.audio_outputs(), !plan.subtitles.is_empty()))
            .map_err(|source| PipelineError::Bundle {
                path: layout.root().to_path_buf(),
                source,
            })?;
        state.send_replace(JobState::Encoding);

        // Build every command first so argument errors surface before anything runs
        let builder = CommandBuilder::new(&self.config, layout, &job.source_path)?;
        let video_spec = builder.video(&video)?;
        let audio_specs = plan
            .audio
            .iter()
            .map(|a| builder.audio(a))
            .collect::<Result<Vec<_>, _>>()?;
        let subtitle_specs = plan
            .subtitles
            .iter()
            .map(|s| builder.subtitle(s))
            .collect::<Result<Vec<_>, _>>()?;

        job.report(&format!("⚙️ Encoding {}...\n{} 0%", job.display_name, progress_bar(0)));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let relay = tokio::spawn(relay_progress(job.clone(), events_rx, self.config.progress_interval()));

        let outcomes = self
            .encode_units(job, video_spec, audio_specs, subtitle_specs, cancel, events_tx)
            .await;

        // Every sender is gone once all units have terminated
        if let Err(e) = relay.await {
            warn!("Job {}: progress relay ended abnormally: {}", job.id, e);
        }

        let (fatal, tracks) = outcomes;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(err) = fatal {
            return Err(PipelineError::FatalUnit(err));
        }

        for (unit, outcome) in tracks {
            if let TrackOutcome::Dropped(reason) = outcome {
                match unit {
                    UnitKind::Audio(i) => plan.drop_audio(i),
                    UnitKind::Subtitle(i) => plan.drop_subtitle(i),
                    _ => {}
                }
                job.report(&format!("⚠️ Dropped {} track: {}", unit, reason));
                dropped.push(DroppedTrack {
                    unit: unit.to_string(),
                    reason,
                });
            }
        }

        // Cancellation can land while tracks are being dropped or the playlist is written
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        state.send_replace(JobState::Composing);
        let master = playlist::compose(&plan, layout.root())?;
        if let Err(e) = layout.release() {
            warn!("Job {}: failed to remove owner marker: {}", job.id, e);
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        state.send_replace(JobState::Finalizing);
        let committed = self.finalizer.commit(job, &master, layout)?;

        Ok(Published {
            master,
            committed,
            bundle_root: layout.root().to_path_buf(),
        })
    }

    /// Video and audio run concurrently; subtitles follow one at a time.
    ///
    /// Returns only after every launched unit has terminated. A video failure
    /// cancels the remaining units and skips subtitles.
    async fn encode_units(
        &self,
        job: &Job,
        video_spec: CommandSpec,
        audio_specs: Vec<CommandSpec>,
        subtitle_specs: Vec<CommandSpec>,
        cancel: &CancellationToken,
        events: mpsc::UnboundedSender<ProgressEvent>,
    ) -> (Option<UnitError>, Vec<(UnitKind, TrackOutcome)>) {
        let units = cancel.child_token();
        let mut tracks = Vec::new();

        let video_task = self.spawn_unit(job, video_spec, &units, &events);
        let audio_tasks: Vec<_> = audio_specs
            .into_iter()
            .map(|spec| (spec.unit, self.spawn_unit(job, spec, &units, &events)))
            .collect();

        let mut fatal = None;
        if let Err(err) = join_unit(UnitKind::Video, video_task).await {
            if !err.was_cancelled() {
                error!("Job {}: video unit failed: {}\n{}", job.id, err.failure, err.excerpt(5));
            }
            units.cancel();
            fatal = Some(err);
        }

        for (unit, task) in audio_tasks {
            let result = join_unit(unit, task).await;
            if let Err(err) = &result {
                if fatal.is_none() {
                    warn!("Job {}: dropping {}: {}\n{}", job.id, unit, err.failure, err.excerpt(5));
                }
            }
            tracks.push((unit, TrackOutcome::from_result(&result)));
        }

        if fatal.is_some() || units.is_cancelled() {
            return (fatal, tracks);
        }

        for spec in subtitle_specs {
            if units.is_cancelled() {
                break;
            }
            let unit = spec.unit;
            let result = run_unit(
                job.id.clone(),
                self.runner.clone(),
                spec,
                units.child_token(),
                self.tracker(unit),
                events.clone(),
            )
            .await;
            if let Err(err) = &result {
                warn!("Job {}: dropping {}: {}\n{}", job.id, unit, err.failure, err.excerpt(5));
            }
            tracks.push((unit, TrackOutcome::from_result(&result)));
        }

        (fatal, tracks)
    }

    fn tracker(&self, unit: UnitKind) -> ProgressTracker {
        ProgressTracker::new(
            unit,
            self.config.progress_interval(),
            self.config.expected_duration(),
            Instant::now(),
        )
    }

    fn spawn_unit(
        &self,
        job: &Job,
        spec: CommandSpec,
        units: &CancellationToken,
        events: &mpsc::UnboundedSender<ProgressEvent>,
    ) -> JoinHandle<Result<(), UnitError>> {
        let tracker = self.tracker(spec.unit);
        tokio::spawn(run_unit(
            job.id.clone(),
            self.runner.clone(),
            spec,
            units.child_token(),
            tracker,
            events.clone(),
        ))
    }
}

async fn join_unit(unit: UnitKind, task: JoinHandle<Result<(), UnitError>>) -> Result<(), UnitError> {
    match task.await {
        Ok(result) => result,
        Err(e) => Err(UnitError {
            unit,
            failure: UnitFailure::Launch(format!("supervisor task failed: {}", e)),
            tail: Vec::new(),
        }),
    }
}

/// Launch one unit, track it to termination, and check its output exists
async fn run_unit(
    job_id: String,
    runner: Arc<dyn ProcessRunner>,
    spec: CommandSpec,
    cancel: CancellationToken,
    tracker: ProgressTracker,
    events: mpsc::UnboundedSender<ProgressEvent>,
) -> Result<(), UnitError> {
    let unit = spec.unit;
    let output = spec.output.clone();

    debug!("Job {}: starting {} unit", job_id, unit);
    let handle = runner.run(spec, cancel).map_err(|e| UnitError {
        unit,
        failure: UnitFailure::Launch(e.to_string()),
        tail: Vec::new(),
    })?;

    let run = track_unit(handle, tracker, events).await;
    if !run.exit.code.is_success() {
        return Err(UnitError {
            unit,
            failure: UnitFailure::Exited(run.exit.code),
            tail: run.tail,
        });
    }
    if let Some(output) = output {
        if !output.is_file() {
            return Err(UnitError {
                unit,
                failure: UnitFailure::MissingOutput(output),
                tail: run.tail,
            });
        }
    }

    info!(
        "Job {}: {} unit finished in {:.1}s",
        job_id,
        unit,
        run.exit.wall_clock.as_secs_f64()
    );
    Ok(())
}

/// Fold per-unit events into throttled status messages.
///
/// The bar follows the video unit; other units are listed alongside.
async fn relay_progress(job: Job, mut events: mpsc::UnboundedReceiver<ProgressEvent>, interval: Duration) {
    let mut percents: BTreeMap<UnitKind, u8> = BTreeMap::new();
    let mut last_report: Option<Instant> = None;
    let mut video_reported = 0u8;

    while let Some(event) = events.recv().await {
        let entry = percents.entry(event.unit).or_insert(0);
        *entry = (*entry).max(event.percent);

        let video = percents.get(&UnitKind::Video).copied().unwrap_or(0);
        let video_done = event.unit.is_video() && video == 100 && video_reported < 100;
        let due = last_report.map_or(true, |t| t.elapsed() >= interval);
        if !(due || video_done) {
            continue;
        }

        let others: Vec<String> = percents
            .iter()
            .filter(|(unit, _)| !unit.is_video())
            .map(|(unit, p)| format!("{} {}%", unit, p))
            .collect();
        let mut text = format!("⚙️ Encoding {}...\n{} {}%", job.display_name, progress_bar(video), video);
        if !others.is_empty() {
            text.push('\n');
            text.push_str(&others.join(" | "));
        }

        job.report(&text);
        video_reported = video;
        last_report = Some(Instant::now());
    }
}

fn success_message(job: &Job, published: &Published, dropped: &[DroppedTrack]) -> String {
    let mut text = format!(
        "✅ Encoding Complete! 🎉\n\n📁 Filename: {}\n📦 Size: {}\n🔑 Token: {}\n🎬 Playlist: {}",
        job.display_name,
        format_size(published.committed.bundle_bytes, DECIMAL),
        published.committed.token,
        published.master.path.display()
    );
    if !dropped.is_empty() {
        let names: Vec<&str> = dropped.iter().map(|d| d.unit.as_str()).collect();
        text.push_str(&format!("\n⚠️ Dropped tracks: {}", names.join(", ")));
    }
    text
}

fn failure_message(err: &PipelineError) -> String {
    let mut text = format!("❌ Encoding Failed! Cleaning up files...\n\n{}", err);
    if let Some(excerpt) = err.excerpt() {
        text.push_str("\n\n");
        text.push_str(&excerpt);
    }
    text
}
