//! Job submission entry point.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use buddy_core::events::{BridgeEvent, EventBus};
use buddy_core::types::{JobId, JobKind};
use chrono::Utc;
use tokio::sync::oneshot;
use tracing::info;

use crate::engine::ImportEngine;
use crate::error::{DispatchError, JobHandleError};
use crate::frontend::FrontEndSender;
use crate::types::{BridgeConfig, ImportJob, JobResult};
use crate::worker::WorkerPool;

/// Routes submitted jobs to the worker for their kind.
///
/// `submit` never blocks, so it is safe to call from the interactive loop.
pub struct JobDispatcher {
    pool: WorkerPool,
    events: EventBus,
}

impl JobDispatcher {
    /// Start the worker pool.
    pub fn start(
        engine: Arc<dyn ImportEngine>,
        config: BridgeConfig,
        front_end: FrontEndSender,
        events: EventBus,
    ) -> Result<Self, DispatchError> {
        let pool = WorkerPool::start(engine, config, front_end, events.clone())?;
        Ok(Self { pool, events })
    }

    /// Queue a job and return a handle that resolves to its result.
    pub fn submit(&self, job: ImportJob) -> Result<JobHandle, DispatchError> {
        let job_id = job.id;
        let kind = job.kind();
        let source = job.source.clone();
        let user = job.user.clone();

        let (tx, rx) = oneshot::channel();
        let depth = self.pool.enqueue(job, tx)?;

        info!(job_id = %job_id, user = %user, depth, "Queued {} import from {}", kind, source);
        self.events.emit(BridgeEvent::JobQueued {
            job_id,
            kind,
            depth,
            timestamp: Utc::now(),
        });
        Ok(JobHandle { job_id, kind, rx })
    }

    /// Jobs of `kind` waiting to start.
    pub fn queue_len(&self, kind: JobKind) -> usize {
        self.pool.queue_len(kind)
    }

    /// Jobs of `kind` waiting or running.
    pub fn in_flight(&self, kind: JobKind) -> usize {
        self.pool.in_flight(kind)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stop accepting jobs and wait for the queued ones. Blocks.
    pub fn shutdown(&mut self) {
        info!("Shutting down import dispatcher");
        self.pool.shutdown();
    }
}

/// Completion handle for a submitted job.
///
/// Await it, or call [`JobHandle::blocking_wait`] off the async runtime.
/// Dropping it does not cancel the job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    kind: JobKind,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn blocking_wait(self) -> Result<JobResult, JobHandleError> {
        let job_id = self.job_id;
        self.rx
            .blocking_recv()
            .map_err(|_| JobHandleError::Dropped(job_id))
    }
}

impl Future for JobHandle {
    type Output = Result<JobResult, JobHandleError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let job_id = self.job_id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| JobHandleError::Dropped(job_id)))
    }
}
