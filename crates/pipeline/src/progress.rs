use std::collections::VecDeque;
use std::time::{Duration, Instant};
use log::trace;
use tokio::sync::mpsc;

use crate::command::UnitKind;
use crate::runner::{ExitResult, ProcessHandle, StreamKind};

/// Diagnostic lines kept per unit for failure excerpts
pub const TAIL_LINES: usize = 20;

/// Elapsed-time progress never claims completion on its own
const ELAPSED_CEILING: u8 = 99;

/// Where a percentage came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSource {
    /// Position over the duration ffmpeg reported
    Duration,
    /// Wall clock over the configured expected duration
    Elapsed,
    /// Unit finished successfully
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub unit: UnitKind,
    pub percent: u8,
    pub source: ProgressSource,
}

/// Turns one unit's diagnostic lines into rate-limited, non-decreasing percentages.
///
/// Malformed lines are ignored. Only the first `Duration:` seen counts; ffmpeg
/// prints one per input and later ones belong to nothing we map.
#[derive(Debug)]
pub struct ProgressTracker {
    unit: UnitKind,
    interval: Duration,
    expected: Duration,
    started: Instant,
    total_secs: Option<f64>,
    best: u8,
    best_source: ProgressSource,
    reported: Option<u8>,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(unit: UnitKind, interval: Duration, expected: Duration, started: Instant) -> Self {
        ProgressTracker {
            unit,
            interval,
            expected: expected.max(Duration::from_secs(1)),
            started,
            total_secs: None,
            best: 0,
            best_source: ProgressSource::Elapsed,
            reported: None,
            last_emit: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn total_secs(&self) -> Option<f64> {
        self.total_secs
    }

    /// Feed one diagnostic line
    pub fn observe(&mut self, line: &str, now: Instant) -> Option<ProgressEvent> {
        let line = line.trim();

        if self.total_secs.is_none() {
            if let Some(total) = parse_duration_marker(line) {
                trace!("{} total duration {:.2}s", self.unit, total);
                self.total_secs = Some(total);
            }
        }

        let total = self.total_secs?;
        let position = parse_position_marker(line)?;
        let percent = (position / total * 100.0).clamp(0.0, 100.0) as u8;
        self.raise(percent, ProgressSource::Duration);
        self.try_emit(now)
    }

    /// Periodic check: elapsed-time fallback, and release of throttled values
    pub fn poll(&mut self, now: Instant) -> Option<ProgressEvent> {
        if self.total_secs.is_none() {
            let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
            let percent = (elapsed / self.expected.as_secs_f64() * 100.0).min(ELAPSED_CEILING as f64) as u8;
            self.raise(percent, ProgressSource::Elapsed);
        }
        self.try_emit(now)
    }

    /// Final event for a unit that exited successfully
    pub fn finish(&mut self) -> ProgressEvent {
        self.best = 100;
        self.best_source = ProgressSource::Complete;
        self.reported = Some(100);
        ProgressEvent {
            unit: self.unit,
            percent: 100,
            source: ProgressSource::Complete,
        }
    }

    fn raise(&mut self, percent: u8, source: ProgressSource) {
        if percent > self.best {
            self.best = percent;
            self.best_source = source;
        }
    }

    fn try_emit(&mut self, now: Instant) -> Option<ProgressEvent> {
        if self.reported.is_some_and(|r| r >= self.best) {
            return None;
        }
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        self.reported = Some(self.best);
        self.last_emit = Some(now);
        Some(ProgressEvent {
            unit: self.unit,
            percent: self.best,
            source: self.best_source,
        })
    }
}

/// `HH:MM:SS.frac` to seconds. Rejects negatives and N/A.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.starts_with('-') {
        return None;
    }
    let mut parts = s.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    let total = hours * 3600.0 + minutes * 60.0 + seconds;
    (total.is_finite() && total >= 0.0).then_some(total)
}

/// `Duration: 00:01:30.50, start: ...` from the input header
fn parse_duration_marker(line: &str) -> Option<f64> {
    let rest = line.strip_prefix("Duration:")?;
    let value = rest.split(',').next()?;
    parse_timestamp(value).filter(|d| *d > 0.0)
}

/// Current output position in seconds from `-progress` output or a stats line
fn parse_position_marker(line: &str) -> Option<f64> {
    // ffmpeg reports out_time_ms in microseconds as well
    if let Some(v) = line
        .strip_prefix("out_time_us=")
        .or_else(|| line.strip_prefix("out_time_ms="))
    {
        let micros: i64 = v.trim().parse().ok()?;
        return (micros >= 0).then(|| micros as f64 / 1_000_000.0);
    }
    if let Some(v) = line.strip_prefix("out_time=") {
        return parse_timestamp(v);
    }
    line.split_whitespace()
        .find_map(|token| token.strip_prefix("time="))
        .and_then(parse_timestamp)
}

/// Result of running one unit to completion
#[derive(Debug)]
pub struct UnitRun {
    pub unit: UnitKind,
    pub exit: ExitResult,
    /// Last stderr lines, oldest first
    pub tail: Vec<String>,
}

/// Drive a unit's line stream through a tracker until the process exits.
///
/// The final 100% event is sent only when the unit succeeded.
pub async fn track_unit(
    mut handle: ProcessHandle,
    mut tracker: ProgressTracker,
    events: mpsc::UnboundedSender<ProgressEvent>,
) -> UnitRun {
    let unit = handle.unit();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
    let mut tick = tokio::time::interval(tracker.interval().max(Duration::from_millis(100)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = handle.next_line() => match line {
                Some(line) => {
                    if line.stream == StreamKind::Stderr {
                        if tail.len() == TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.text.clone());
                    }
                    if let Some(event) = tracker.observe(&line.text, Instant::now()) {
                        let _ = events.send(event);
                    }
                }
                None => break,
            },
            _ = tick.tick() => {
                if let Some(event) = tracker.poll(Instant::now()) {
                    let _ = events.send(event);
                }
            }
        }
    }

    let exit = handle.wait().await;
    if exit.code.is_success() {
        let _ = events.send(tracker.finish());
    }

    UnitRun {
        unit,
        exit,
        tail: tail.into(),
    }
}
