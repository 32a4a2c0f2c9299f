//! Interactive-side pump for worker events.
//!
//! Workers never touch a [`Respondable`] directly. They send
//! [`FrontEndEvent`]s over an unbounded channel and the [`FrontEnd`] task,
//! running on the interactive loop, performs the message operations in
//! arrival order.

use std::sync::Arc;

use buddy_core::types::{ConfirmationOutcome, JobId, JobKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::confirmation::{ConfirmationGate, ConfirmationResponder};
use crate::error::DeliveryError;
use crate::respondable::Respondable;
use crate::types::{ConfirmationRequest, JobResult, Payload, ProgressUpdate};

/// Longest error text shown to users.
const MAX_ERROR_CHARS: usize = 1000;

/// Work handed from a worker thread to the interactive loop.
pub enum FrontEndEvent {
    Progress {
        job_id: JobId,
        respondable: Arc<dyn Respondable>,
        update: ProgressUpdate,
    },
    ConfirmationRequested {
        respondable: Arc<dyn Respondable>,
        request: ConfirmationRequest,
        responder: ConfirmationResponder,
    },
    Finished {
        job_id: JobId,
        kind: JobKind,
        respondable: Arc<dyn Respondable>,
        result: JobResult,
    },
}

pub type FrontEndSender = mpsc::UnboundedSender<FrontEndEvent>;
pub type FrontEndReceiver = mpsc::UnboundedReceiver<FrontEndEvent>;

/// Create the worker-to-front-end channel.
pub fn channel() -> (FrontEndSender, FrontEndReceiver) {
    mpsc::unbounded_channel()
}

/// Reduce an engine error to something fit for a chat message.
pub fn sanitize_error(message: &str) -> String {
    let line = message.lines().map(str::trim).find(|l| !l.is_empty());
    match line {
        Some(line) if line.chars().count() > MAX_ERROR_CHARS => {
            let mut short: String = line.chars().take(MAX_ERROR_CHARS).collect();
            short.push_str("...");
            short
        }
        Some(line) => line.to_string(),
        None => "Unknown error".to_string(),
    }
}

fn log_delivery(job_id: JobId, what: &str, result: Result<(), DeliveryError>) {
    if let Err(e) = result {
        warn!(job_id = %job_id, "Failed to {}: {}", what, e);
    }
}

/// Drains [`FrontEndEvent`]s until every sender is gone.
pub struct FrontEnd {
    rx: FrontEndReceiver,
    gate: Arc<ConfirmationGate>,
}

impl FrontEnd {
    pub fn new(rx: FrontEndReceiver, gate: Arc<ConfirmationGate>) -> Self {
        Self { rx, gate }
    }

    /// The registry that overwrite answers are routed through.
    pub fn gate(&self) -> Arc<ConfirmationGate> {
        Arc::clone(&self.gate)
    }

    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle(event).await;
        }
        debug!("Front end channel closed");
    }

    async fn handle(&self, event: FrontEndEvent) {
        match event {
            FrontEndEvent::Progress {
                job_id,
                respondable,
                update,
            } => {
                let payload = Payload::Progress { text: update.text };
                log_delivery(job_id, "post progress", respondable.edit(payload).await);
            }
            FrontEndEvent::ConfirmationRequested {
                respondable,
                request,
                responder,
            } => self.open_prompt(respondable, request, responder).await,
            FrontEndEvent::Finished {
                job_id,
                kind,
                respondable,
                result,
            } => deliver_result(job_id, kind, respondable.as_ref(), result).await,
        }
    }

    async fn open_prompt(
        &self,
        respondable: Arc<dyn Respondable>,
        request: ConfirmationRequest,
        responder: ConfirmationResponder,
    ) {
        let job_id = request.job_id;
        let request_id = request.id;
        let deadline = tokio::time::Instant::from_std(request.deadline);
        let payload = Payload::overwrite_prompt(&request);

        self.gate.register(request, responder.clone());
        log_delivery(job_id, "show overwrite prompt", respondable.edit(payload).await);

        let gate = Arc::clone(&self.gate);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if gate.expire(request_id) {
                info!(job_id = %job_id, request_id = %request_id, "Overwrite prompt expired");
            }
            // An answered prompt was already replaced by the job's result.
            if responder.outcome() != Some(ConfirmationOutcome::TimedOut) {
                return;
            }
            log_delivery(job_id, "remove prompt controls", respondable.clear_prompt().await);
        });
    }
}

/// Post a job's terminal result to its respondable.
async fn deliver_result(job_id: JobId, kind: JobKind, respondable: &dyn Respondable, result: JobResult) {
    match result {
        JobResult::Success { artifact, count } => {
            log_delivery(job_id, "remove progress message", respondable.delete_or_replace().await);
            let added_by = respondable.user().clone();
            let payload = match kind {
                JobKind::Pack => Payload::PackAdded {
                    pack: artifact,
                    course_count: count,
                    added_by,
                },
                JobKind::Song => Payload::SongAdded {
                    song: artifact,
                    added_by,
                },
            };
            log_delivery(job_id, "send result", respondable.send_final(payload).await);
        }
        JobResult::Cancelled => {
            log_delivery(job_id, "report cancellation", respondable.edit(Payload::Cancelled).await);
            log_delivery(job_id, "remove prompt controls", respondable.clear_prompt().await);
        }
        JobResult::Failed(message) => {
            let payload = Payload::Error {
                message: sanitize_error(&message),
            };
            log_delivery(job_id, "report error", respondable.edit(payload).await);
            log_delivery(job_id, "remove prompt controls", respondable.clear_prompt().await);
        }
    }
}
