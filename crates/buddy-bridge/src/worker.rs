//! Per-kind worker threads.
//!
//! One OS thread per [`JobKind`], each draining its own FIFO queue. Jobs of
//! the same kind never overlap; jobs of different kinds may. The import
//! engine is only ever called from these threads.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use buddy_core::events::{BridgeEvent, EventBus};
use buddy_core::types::JobKind;
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::confirmation::ConfirmationBridge;
use crate::engine::ImportEngine;
use crate::error::{DispatchError, EngineError};
use crate::frontend::{FrontEndEvent, FrontEndSender};
use crate::progress::ProgressRelay;
use crate::types::{Artifact, BridgeConfig, ImportJob, ImportTargets, JobResult};

struct QueuedJob {
    job: ImportJob,
    reply: oneshot::Sender<JobResult>,
}

/// State shared between a lane's owner and its thread.
struct LaneState {
    queue: Mutex<VecDeque<QueuedJob>>,
    condvar: Condvar,
    stop_flag: AtomicBool,
    /// Queued plus running.
    in_flight: AtomicUsize,
}

impl LaneState {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            stop_flag: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<QueuedJob>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal_stop(&self) {
        let _queue = self.lock_queue();
        self.stop_flag.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }
}

struct Lane {
    kind: JobKind,
    state: Arc<LaneState>,
    thread: Option<JoinHandle<()>>,
}

/// Everything a worker thread needs to run jobs.
#[derive(Clone)]
struct WorkerContext {
    engine: Arc<dyn ImportEngine>,
    config: BridgeConfig,
    front_end: FrontEndSender,
    events: EventBus,
}

/// Fixed pool: one worker thread per job kind.
pub struct WorkerPool {
    lanes: Vec<Lane>,
    max_queue_depth: usize,
}

impl WorkerPool {
    /// Spawn one worker per kind.
    pub fn start(
        engine: Arc<dyn ImportEngine>,
        config: BridgeConfig,
        front_end: FrontEndSender,
        events: EventBus,
    ) -> Result<Self, DispatchError> {
        let max_queue_depth = config.max_queue_depth.max(1);
        let context = WorkerContext {
            engine,
            config,
            front_end,
            events,
        };

        let mut pool = Self {
            lanes: Vec::with_capacity(JobKind::ALL.len()),
            max_queue_depth,
        };
        for kind in JobKind::ALL {
            let state = Arc::new(LaneState::new());
            let thread_state = Arc::clone(&state);
            let thread_context = context.clone();
            let spawned = thread::Builder::new()
                .name(format!("import-{}", kind))
                .spawn(move || worker_loop(kind, thread_state, thread_context));

            match spawned {
                Ok(handle) => pool.lanes.push(Lane {
                    kind,
                    state,
                    thread: Some(handle),
                }),
                Err(source) => {
                    error!("Failed to spawn {} worker: {}", kind, source);
                    pool.shutdown();
                    return Err(DispatchError::Spawn { kind, source });
                }
            }
        }

        info!(
            max_queue_depth,
            "Import worker pool started with {} threads",
            pool.lanes.len()
        );
        Ok(pool)
    }

    fn lane(&self, kind: JobKind) -> Option<&Lane> {
        self.lanes.iter().find(|lane| lane.kind == kind)
    }

    /// Queue a job on its kind's worker. Never blocks on a full queue.
    ///
    /// Returns the lane depth (queued plus running) including this job.
    pub fn enqueue(
        &self,
        job: ImportJob,
        reply: oneshot::Sender<JobResult>,
    ) -> Result<usize, DispatchError> {
        let kind = job.kind();
        let lane = self.lane(kind).ok_or(DispatchError::ShuttingDown)?;

        let mut queue = lane.state.lock_queue();
        if lane.state.stop_flag.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }
        let depth = lane.state.in_flight.load(Ordering::SeqCst);
        if depth >= self.max_queue_depth {
            warn!(kind = %kind, depth, "Rejected job, queue full");
            return Err(DispatchError::QueueFull { kind, depth });
        }
        lane.state.in_flight.fetch_add(1, Ordering::SeqCst);
        queue.push_back(QueuedJob { job, reply });
        lane.state.condvar.notify_one();
        Ok(depth + 1)
    }

    /// Jobs of `kind` waiting to start.
    pub fn queue_len(&self, kind: JobKind) -> usize {
        self.lane(kind)
            .map(|lane| lane.state.lock_queue().len())
            .unwrap_or(0)
    }

    /// Jobs of `kind` waiting or running.
    pub fn in_flight(&self, kind: JobKind) -> usize {
        self.lane(kind)
            .map(|lane| lane.state.in_flight.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Stop accepting jobs, let queued ones finish, then join the threads.
    pub fn shutdown(&mut self) {
        for lane in &self.lanes {
            lane.state.signal_stop();
        }
        for lane in &mut self.lanes {
            if let Some(handle) = lane.thread.take() {
                if handle.join().is_err() {
                    error!("{} worker thread panicked", lane.kind);
                }
            }
        }
        debug!("Import worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Threads finish their queues on their own; no join here.
        for lane in &self.lanes {
            lane.state.signal_stop();
        }
    }
}

fn worker_loop(kind: JobKind, state: Arc<LaneState>, context: WorkerContext) {
    debug!("{} worker started", kind);
    loop {
        let next = {
            let mut queue = state.lock_queue();
            while queue.is_empty() && !state.stop_flag.load(Ordering::SeqCst) {
                queue = state
                    .condvar
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            queue.pop_front()
        };

        // Empty after the wait means stop was requested.
        let Some(QueuedJob { job, reply }) = next else {
            break;
        };

        let job_id = job.id;
        let respondable = Arc::clone(&job.respondable);
        let result = run_job(&job, &context);

        let finished = FrontEndEvent::Finished {
            job_id,
            kind,
            respondable,
            result: result.clone(),
        };
        if context.front_end.send(finished).is_err() {
            warn!(job_id = %job_id, "Front end closed, result not delivered");
        }
        if reply.send(result).is_err() {
            debug!(job_id = %job_id, "Job handle dropped before completion");
        }
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("{} worker exiting", kind);
}

/// Run one job to a terminal result. Engine failures and panics stop here.
fn run_job(job: &ImportJob, context: &WorkerContext) -> JobResult {
    let kind = job.kind();
    info!(job_id = %job.id, source = %job.source, user = %job.user, "Starting {} import", kind);
    context.events.emit(BridgeEvent::JobStarted {
        job_id: job.id,
        kind,
        timestamp: Utc::now(),
    });

    let mut relay = ProgressRelay::new(
        job.id,
        Arc::clone(&job.respondable),
        context.front_end.clone(),
        context.events.clone(),
        context.config.progress_throttle,
    );
    let bridge = ConfirmationBridge::new(
        job,
        context.front_end.clone(),
        context.events.clone(),
        context.config.confirmation_timeout,
    );
    let overwrite = |new: &Artifact, existing: &Artifact| bridge.allows(new, existing);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &job.targets {
        ImportTargets::Pack { packs, courses } => context
            .engine
            .add_pack(&job.source, packs, courses, &mut relay, &overwrite)
            .map(|import| JobResult::Success {
                artifact: import.pack,
                count: import.course_count,
            }),
        ImportTargets::Song { singles, cache } => context
            .engine
            .add_song(&job.source, singles, cache.as_deref(), &mut relay, &overwrite)
            .map(|import| JobResult::Success {
                artifact: Artifact::new(import.song.name, import.stored_path),
                count: 1,
            }),
    }));

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(EngineError::OverwriteDenied)) => JobResult::Cancelled,
        Ok(Err(e)) => {
            error!(job_id = %job.id, source = %job.source, "{} import failed: {:?}", kind, e);
            JobResult::Failed(e.to_string())
        }
        Err(payload) => {
            let message = format!("import engine panicked: {}", panic_message(payload.as_ref()));
            error!(job_id = %job.id, "{}", message);
            JobResult::Failed(message)
        }
    };

    let status = result.status();
    info!(job_id = %job.id, status = %status, "Finished {} import", kind);
    context.events.emit(BridgeEvent::JobFinished {
        job_id: job.id,
        kind,
        status,
        timestamp: Utc::now(),
    });
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
