use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use log::{debug, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandSpec, UnitKind};
use crate::config::PipelineConfig;
use crate::error::RunnerError;

/// Lines buffered between the pipe readers and the consumer
const LINE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One line of diagnostic output from a running unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
}

/// How a unit ended. Cancellation is never reported as a non-zero exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitCode {
    Success,
    /// Non-zero exit; `None` when killed by a signal we did not send
    Failed(Option<i32>),
    Cancelled,
}

impl ExitCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Success => write!(f, "exited successfully"),
            ExitCode::Failed(Some(code)) => write!(f, "exit code {}", code),
            ExitCode::Failed(None) => write!(f, "terminated by signal"),
            ExitCode::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitResult {
    pub code: ExitCode,
    pub wall_clock: Duration,
}

/// A launched unit: line stream, cancellation, and final exit result
pub struct ProcessHandle {
    unit: UnitKind,
    lines: mpsc::Receiver<OutputLine>,
    cancel: CancellationToken,
    exit: JoinHandle<ExitResult>,
}

impl ProcessHandle {
    /// Assemble a handle from its parts; `exit` must resolve once the unit has terminated
    pub fn new(
        unit: UnitKind,
        lines: mpsc::Receiver<OutputLine>,
        cancel: CancellationToken,
        exit: JoinHandle<ExitResult>,
    ) -> Self {
        ProcessHandle { unit, lines, cancel, exit }
    }

    pub fn unit(&self) -> UnitKind {
        self.unit
    }

    /// Request termination; the exit result will report `Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next diagnostic line, or `None` once both output streams are closed
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.lines.recv().await
    }

    /// Wait for the unit to terminate. Remaining lines are discarded.
    pub async fn wait(self) -> ExitResult {
        let unit = self.unit;
        drop(self.lines);
        match self.exit.await {
            Ok(result) => result,
            Err(e) => {
                warn!("Supervisor for {} unit panicked or was aborted: {}", unit, e);
                ExitResult { code: ExitCode::Failed(None), wall_clock: Duration::ZERO }
            }
        }
    }
}

/// Launches external processes. Implemented by [`FfmpegRunner`] and by fakes in tests.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, spec: CommandSpec, cancel: CancellationToken) -> Result<ProcessHandle, RunnerError>;
}

/// Runs commands as real child processes, each in its own process group
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    grace: Duration,
}

impl FfmpegRunner {
    pub fn new(cfg: &PipelineConfig) -> Self {
        FfmpegRunner { grace: cfg.cancel_grace() }
    }

    pub fn with_grace(grace: Duration) -> Self {
        FfmpegRunner { grace }
    }
}

impl ProcessRunner for FfmpegRunner {
    fn run(&self, spec: CommandSpec, cancel: CancellationToken) -> Result<ProcessHandle, RunnerError> {
        debug!("Executing {}: {}", spec.unit, spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // New process group so cancellation reaches anything ffmpeg forks
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or(RunnerError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(RunnerError::Pipe("stderr"))?;

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        tokio::spawn(forward_lines(stdout, StreamKind::Stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, StreamKind::Stderr, tx));

        let unit = spec.unit;
        let grace = self.grace;
        let token = cancel.clone();
        let exit = tokio::spawn(async move { supervise(child, unit, token, grace, started).await });

        Ok(ProcessHandle::new(unit, rx, cancel, exit))
    }
}

async fn supervise(
    mut child: Child,
    unit: UnitKind,
    cancel: CancellationToken,
    grace: Duration,
    started: Instant,
) -> ExitResult {
    let code = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(&mut child, unit, grace).await;
            ExitCode::Cancelled
        }
        status = child.wait() => match status {
            Ok(s) if s.success() => ExitCode::Success,
            Ok(s) => ExitCode::Failed(s.code()),
            Err(e) => {
                warn!("Failed to wait for {} unit: {}", unit, e);
                ExitCode::Failed(None)
            }
        },
    };

    let wall_clock = started.elapsed();
    debug!("{} unit {} after {:.1}s", unit, code, wall_clock.as_secs_f64());
    ExitResult { code, wall_clock }
}

/// SIGTERM the unit's process group, wait up to `grace`, then SIGKILL whatever is left
async fn terminate(child: &mut Child, unit: UnitKind, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    debug!("Terminating {} unit (pid {})", unit, pid);
    signal_group(child, pid, false);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {
            // Leader is gone; stragglers in its group still get killed
            signal_group(child, pid, true);
        }
        Err(_) => {
            warn!("{} unit ignored SIGTERM for {:?}, killing", unit, grace);
            signal_group(child, pid, true);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill {} unit: {}", unit, e);
            }
        }
    }
}

#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: u32, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        // ESRCH: group already empty
        if e != nix::errno::Errno::ESRCH {
            warn!("Failed to send {:?} to process group {}: {}", signal, pid, e);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: u32, _force: bool) {
    let _ = child.start_kill();
}

/// Forward a pipe line by line. Carriage returns also end a line so that
/// ffmpeg's in-place status updates arrive individually.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, stream: StreamKind, tx: mpsc::Sender<OutputLine>) {
    let mut segments = BufReader::new(reader).split(b'\n');
    let mut open = true;

    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                // Keep draining after the consumer goes away so the child never blocks on a full pipe
                if !open {
                    continue;
                }
                for part in String::from_utf8_lossy(&bytes).split('\r') {
                    let text = part.trim_end();
                    if text.is_empty() {
                        continue;
                    }
                    let line = OutputLine { stream, text: text.to_string() };
                    if tx.send(line).await.is_err() {
                        open = false;
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(unit: UnitKind, script: &str) -> CommandSpec {
        CommandSpec::new(unit, "sh", vec!["-c".to_string(), script.to_string()]).unwrap()
    }

    async fn collect(handle: &mut ProcessHandle) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        while let Some(line) = handle.next_line().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_lines_from_both_streams() {
        let runner = FfmpegRunner::with_grace(Duration::from_secs(1));
        let mut handle = runner
            .run(sh(UnitKind::Video, "echo out; echo err >&2; printf 'a\\rb\\n'"), CancellationToken::new())
            .unwrap();

        let lines = collect(&mut handle).await;
        let result = handle.wait().await;

        assert_eq!(result.code, ExitCode::Success);
        assert!(lines.contains(&OutputLine { stream: StreamKind::Stdout, text: "out".to_string() }));
        assert!(lines.contains(&OutputLine { stream: StreamKind::Stderr, text: "err".to_string() }));
        let stdout: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == StreamKind::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["out", "a", "b"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_not_cancelled() {
        let runner = FfmpegRunner::with_grace(Duration::from_secs(1));
        let mut handle = runner.run(sh(UnitKind::Audio(0), "exit 3"), CancellationToken::new()).unwrap();
        collect(&mut handle).await;
        assert_eq!(handle.wait().await.code, ExitCode::Failed(Some(3)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = FfmpegRunner::with_grace(Duration::from_secs(1));
        let spec = CommandSpec::new(UnitKind::Video, "/nonexistent/ffmpeg", vec![]).unwrap();
        assert!(matches!(
            runner.run(spec, CancellationToken::new()),
            Err(RunnerError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_terminates_process_group() {
        let runner = FfmpegRunner::with_grace(Duration::from_secs(2));
        let token = CancellationToken::new();
        // The background sleep is a grandchild; it must die with the group
        let mut handle = runner
            .run(sh(UnitKind::Video, "sleep 30 & echo started; wait"), token.clone())
            .unwrap();

        let first = handle.next_line().await.unwrap();
        assert_eq!(first.text, "started");

        let begun = Instant::now();
        token.cancel();
        // Pipes close only once every process holding them is gone
        collect(&mut handle).await;
        let result = handle.wait().await;

        assert_eq!(result.code, ExitCode::Cancelled);
        assert!(begun.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancel_escalates_to_kill() {
        let runner = FfmpegRunner::with_grace(Duration::from_millis(300));
        let mut handle = runner
            .run(sh(UnitKind::Video, "trap '' TERM; echo ready; sleep 30"), CancellationToken::new())
            .unwrap();
        assert_eq!(handle.next_line().await.unwrap().text, "ready");

        let begun = Instant::now();
        handle.cancel();
        collect(&mut handle).await;
        assert_eq!(handle.wait().await.code, ExitCode::Cancelled);
        assert!(begun.elapsed() < Duration::from_secs(10));
    }
}
