use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::QueueError;
use crate::job::{Job, JobOutcome, JobRequest, JobState};
use crate::pipeline::Pipeline;
use crate::runner::ProcessRunner;
use crate::store::MetadataStore;

/// Buffered outcomes per subscriber before the slowest one starts lagging
const OUTCOME_BUFFER: usize = 64;

/// Receipt for an accepted job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobTicket {
    pub job_id: String,
    /// 1-based place among jobs still waiting to start
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was still queued and has been removed
    Removed,
    /// Is running; termination has been requested
    Signalled,
    NotFound,
}

struct InFlight {
    job_id: String,
    cancel: CancellationToken,
    state: watch::Receiver<JobState>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    current: Option<InFlight>,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    outcomes: broadcast::Sender<JobOutcome>,
    shutdown: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state stays consistent across a panicking holder; keep going
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, outcome: JobOutcome) {
        // No subscribers is fine
        let _ = self.outcomes.send(outcome);
    }
}

/// Single-worker FIFO encode queue.
///
/// Exactly one job runs at a time. `enqueue` never blocks; the worker is a
/// tokio task owned by the queue and stops with [`EncodeQueue::stop`].
pub struct EncodeQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EncodeQueue {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn start(config: PipelineConfig, runner: Arc<dyn ProcessRunner>, store: Arc<dyn MetadataStore>) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_BUFFER);
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            outcomes,
            shutdown: CancellationToken::new(),
        });

        let pipeline = Pipeline::new(config, runner, store);
        let worker = tokio::spawn(worker_loop(inner.clone(), pipeline));

        EncodeQueue {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Accept a job at the back of the queue
    pub fn enqueue(&self, request: JobRequest) -> Result<JobTicket, QueueError> {
        let job = Job::new(request);
        let ticket = {
            let mut st = self.inner.lock();
            if self.inner.shutdown.is_cancelled() {
                return Err(QueueError::Stopped);
            }
            st.pending.push_back(job.clone());
            JobTicket {
                job_id: job.id.clone(),
                position: st.pending.len(),
            }
        };
        self.inner.notify.notify_one();

        info!(
            "Queued job {} at position #{}: {}",
            ticket.job_id,
            ticket.position,
            job.source_path.display()
        );
        job.report(&format!("📥 {} queued at position #{}", job.display_name, ticket.position));
        Ok(ticket)
    }

    /// Cancel a queued or running job
    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let removed = {
            let mut st = self.inner.lock();
            if let Some(pos) = st.pending.iter().position(|j| j.id == job_id) {
                st.pending.remove(pos)
            } else {
                if let Some(current) = st.current.as_ref().filter(|c| c.job_id == job_id) {
                    info!("Job {}: cancellation requested", job_id);
                    current.cancel.cancel();
                    return CancelOutcome::Signalled;
                }
                return CancelOutcome::NotFound;
            }
        };

        match removed {
            Some(job) => {
                info!("Job {}: removed from queue", job.id);
                job.report(&format!("🚫 {} cancelled before encoding started", job.display_name));
                self.inner.publish(JobOutcome::failed(&job, "cancelled before start"));
                CancelOutcome::Removed
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// 1-based position of a job that has not started yet
    pub fn position(&self, job_id: &str) -> Option<usize> {
        self.inner
            .lock()
            .pending
            .iter()
            .position(|j| j.id == job_id)
            .map(|i| i + 1)
    }

    /// Current state of a queued or running job
    pub fn state(&self, job_id: &str) -> Option<JobState> {
        let st = self.inner.lock();
        if st.pending.iter().any(|j| j.id == job_id) {
            return Some(JobState::Queued);
        }
        st.current
            .as_ref()
            .filter(|c| c.job_id == job_id)
            .map(|c| *c.state.borrow())
    }

    /// Jobs waiting to start
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a job is currently running
    pub fn is_busy(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    /// Terminal outcomes of every job from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.inner.outcomes.subscribe()
    }

    /// Stop accepting jobs, cancel the running one, fail the rest, and wait for the worker
    pub async fn stop(&self) {
        let pending: Vec<Job> = {
            let mut st = self.inner.lock();
            self.inner.shutdown.cancel();
            st.pending.drain(..).collect()
        };

        for job in pending {
            job.report(&format!("🚫 {} was not encoded: queue stopped", job.display_name));
            self.inner.publish(JobOutcome::failed(&job, "queue stopped"));
        }

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Encode worker ended abnormally: {}", e);
            }
        }
        info!("Encode queue stopped");
    }
}

impl Drop for EncodeQueue {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn worker_loop(inner: Arc<Inner>, pipeline: Pipeline) {
    info!("Encode worker started (one job at a time)");

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let next = {
            let mut st = inner.lock();
            st.pending.pop_front().map(|job| {
                let (state_tx, state_rx) = watch::channel(JobState::Queued);
                let cancel = inner.shutdown.child_token();
                st.current = Some(InFlight {
                    job_id: job.id.clone(),
                    cancel: cancel.clone(),
                    state: state_rx,
                });
                (job, cancel, state_tx)
            })
        };

        let Some((job, cancel, state_tx)) = next else {
            tokio::select! {
                _ = inner.notify.notified() => {}
                _ = inner.shutdown.cancelled() => break,
            }
            continue;
        };

        info!("Starting job {}: {}", job.id, job.source_path.display());
        let waited = chrono::Utc::now() - job.enqueued_at;
        if waited.num_seconds() > 0 {
            info!("Job {}: waited {}s in queue", job.id, waited.num_seconds());
        }

        let outcome = pipeline.run(&job, &cancel, &state_tx).await;
        inner.lock().current = None;
        inner.publish(outcome);
    }

    info!("Encode worker exiting");
}
