//! Overwrite confirmation between a worker thread and the front end.
//!
//! A worker that hits an existing pack or song blocks in
//! [`ConfirmationBridge::decide`] until the job's user answers, the deadline
//! passes, or the front end goes away. The front end keeps the open requests
//! in a [`ConfirmationGate`] and answers them through a
//! [`ConfirmationResponder`]. Every request is resolved exactly once; the
//! first writer wins.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use buddy_core::config::MAX_CONFIRMATION_TIMEOUT;
use buddy_core::events::{BridgeEvent, EventBus};
use buddy_core::types::{ConfirmationOutcome, JobId, JobKind, RequestId, UserId};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::ConfirmationError;
use crate::frontend::{FrontEndEvent, FrontEndSender};
use crate::respondable::Respondable;
use crate::types::{Artifact, ConfirmationRequest, ImportJob};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Outcome slot
// =============================================================================

/// Single-assignment cell the worker waits on.
#[derive(Debug, Default)]
struct OutcomeSlot {
    state: Mutex<Option<ConfirmationOutcome>>,
    cond: Condvar,
}

impl OutcomeSlot {
    /// Set the outcome. Fails with the existing value if already set.
    fn resolve(&self, outcome: ConfirmationOutcome) -> Result<(), ConfirmationOutcome> {
        let mut state = lock(&self.state);
        if let Some(existing) = *state {
            return Err(existing);
        }
        *state = Some(outcome);
        self.cond.notify_all();
        Ok(())
    }

    fn peek(&self) -> Option<ConfirmationOutcome> {
        *lock(&self.state)
    }

    /// Block until resolved; resolves as `TimedOut` once `deadline` passes.
    fn wait_until(&self, deadline: Instant) -> ConfirmationOutcome {
        let mut state = lock(&self.state);
        loop {
            if let Some(outcome) = *state {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                *state = Some(ConfirmationOutcome::TimedOut);
                self.cond.notify_all();
                return ConfirmationOutcome::TimedOut;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

// =============================================================================
// Responder
// =============================================================================

/// Front-end handle for answering one confirmation request.
#[derive(Debug, Clone)]
pub struct ConfirmationResponder {
    request_id: RequestId,
    owner: UserId,
    slot: Arc<OutcomeSlot>,
}

impl ConfirmationResponder {
    /// Answer the request on behalf of `actor`.
    ///
    /// Only the job's user may answer; anyone else gets `Unauthorized` and the
    /// request stays open.
    pub fn respond(
        &self,
        actor: &UserId,
        allow: bool,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        if actor != &self.owner {
            warn!(
                request_id = %self.request_id,
                actor = %actor,
                owner = %self.owner,
                "Rejected overwrite answer from another user"
            );
            return Err(ConfirmationError::Unauthorized {
                owner: self.owner.clone(),
            });
        }
        let outcome = if allow {
            ConfirmationOutcome::Allow
        } else {
            ConfirmationOutcome::Deny
        };
        self.slot
            .resolve(outcome)
            .map_err(ConfirmationError::AlreadyResolved)?;
        debug!(request_id = %self.request_id, outcome = %outcome, "Overwrite answered");
        Ok(outcome)
    }

    /// Resolve as timed out. Returns `false` if an answer got there first.
    pub fn expire(&self) -> bool {
        self.slot.resolve(ConfirmationOutcome::TimedOut).is_ok()
    }

    pub fn outcome(&self) -> Option<ConfirmationOutcome> {
        self.slot.peek()
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome().is_some()
    }
}

// =============================================================================
// Worker side
// =============================================================================

/// Per-job overwrite callback target, used on the worker thread.
pub struct ConfirmationBridge {
    job_id: JobId,
    kind: JobKind,
    user: UserId,
    respondable: Arc<dyn Respondable>,
    front_end: FrontEndSender,
    events: EventBus,
    timeout: Duration,
}

impl ConfirmationBridge {
    pub fn new(
        job: &ImportJob,
        front_end: FrontEndSender,
        events: EventBus,
        timeout: Duration,
    ) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind(),
            user: job.user.clone(),
            respondable: Arc::clone(&job.respondable),
            front_end,
            events,
            timeout: timeout.min(MAX_CONFIRMATION_TIMEOUT),
        }
    }

    /// Ask the job's user whether `new` may replace `existing`, blocking the
    /// calling thread until there is an outcome.
    pub fn decide(&self, new: &Artifact, existing: &Artifact) -> ConfirmationOutcome {
        let deadline = Instant::now() + self.timeout;
        let expires_at: DateTime<Utc> = Utc::now()
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::zero());

        let request = ConfirmationRequest {
            id: RequestId::new(),
            job_id: self.job_id,
            kind: self.kind,
            new: new.clone(),
            existing: existing.clone(),
            user: self.user.clone(),
            deadline,
            expires_at,
        };
        let slot = Arc::new(OutcomeSlot::default());
        let responder = ConfirmationResponder {
            request_id: request.id,
            owner: self.user.clone(),
            slot: Arc::clone(&slot),
        };

        info!(
            job_id = %self.job_id,
            request_id = %request.id,
            existing = %existing.name,
            "Asking to overwrite existing {}",
            self.kind
        );
        self.events.emit(BridgeEvent::ConfirmationRequested {
            request_id: request.id,
            job_id: self.job_id,
            timestamp: Utc::now(),
        });

        let request_id = request.id;
        let event = FrontEndEvent::ConfirmationRequested {
            respondable: Arc::clone(&self.respondable),
            request,
            responder,
        };
        if self.front_end.send(event).is_err() {
            warn!(job_id = %self.job_id, "Front end closed, declining overwrite");
            let _ = slot.resolve(ConfirmationOutcome::Deny);
        }

        let outcome = slot.wait_until(deadline);
        match outcome {
            ConfirmationOutcome::TimedOut => {
                warn!(job_id = %self.job_id, request_id = %request_id, "Overwrite prompt timed out")
            }
            _ => info!(job_id = %self.job_id, request_id = %request_id, outcome = %outcome, "Overwrite resolved"),
        }
        self.events.emit(BridgeEvent::ConfirmationResolved {
            request_id,
            job_id: self.job_id,
            outcome,
            timestamp: Utc::now(),
        });
        outcome
    }

    /// `decide`, reduced to the boolean the import engine expects.
    pub fn allows(&self, new: &Artifact, existing: &Artifact) -> bool {
        self.decide(new, existing).is_allowed()
    }
}

// =============================================================================
// Front-end side
// =============================================================================

/// An open overwrite prompt.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    responder: ConfirmationResponder,
    pub registered_at: DateTime<Utc>,
}

/// Registry of open overwrite prompts, keyed by request id.
#[derive(Debug, Default)]
pub struct ConfirmationGate {
    pending: Mutex<VecDeque<PendingConfirmation>>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request. Entries already resolved elsewhere are dropped.
    pub fn register(&self, request: ConfirmationRequest, responder: ConfirmationResponder) {
        let mut pending = lock(&self.pending);
        pending.retain(|p| !p.responder.is_resolved());
        pending.push_back(PendingConfirmation {
            request,
            responder,
            registered_at: Utc::now(),
        });
    }

    /// Allow the overwrite.
    pub fn approve(
        &self,
        request_id: RequestId,
        actor: &UserId,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        self.answer(request_id, actor, true)
    }

    /// Decline the overwrite.
    pub fn deny(
        &self,
        request_id: RequestId,
        actor: &UserId,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        self.answer(request_id, actor, false)
    }

    fn answer(
        &self,
        request_id: RequestId,
        actor: &UserId,
        allow: bool,
    ) -> Result<ConfirmationOutcome, ConfirmationError> {
        let mut pending = lock(&self.pending);
        let pos = pending
            .iter()
            .position(|p| p.request.id == request_id)
            .ok_or(ConfirmationError::NotFound(request_id))?;

        let result = pending[pos].responder.respond(actor, allow);
        match result {
            Err(err @ ConfirmationError::Unauthorized { .. }) => Err(err),
            result => {
                pending.remove(pos);
                result
            }
        }
    }

    /// Expire a request whose deadline passed.
    ///
    /// Returns `true` only if the request was still open, i.e. this call
    /// produced the timeout.
    pub fn expire(&self, request_id: RequestId) -> bool {
        let mut pending = lock(&self.pending);
        match pending.iter().position(|p| p.request.id == request_id) {
            Some(pos) => pending
                .remove(pos)
                .map(|p| p.responder.expire())
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn get(&self, request_id: RequestId) -> Option<ConfirmationRequest> {
        lock(&self.pending)
            .iter()
            .find(|p| p.request.id == request_id)
            .map(|p| p.request.clone())
    }

    /// Ids of the open requests, oldest first.
    pub fn pending_ids(&self) -> Vec<RequestId> {
        lock(&self.pending).iter().map(|p| p.request.id).collect()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}
