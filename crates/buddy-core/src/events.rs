use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{ConfirmationOutcome, JobId, JobKind, JobStatus, RequestId};

/// Observability events emitted by the execution bridge.
///
/// Events are published on the [`EventBus`] and consumed by:
/// - The binary's event logger (JSON lines at debug level)
/// - Tests that assert ordering and outcomes
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum BridgeEvent {
    // =========================================================================
    // Job Lifecycle Events
    // =========================================================================
    /// A job was accepted onto its kind's queue.
    JobQueued {
        job_id: JobId,
        kind: JobKind,
        depth: usize,
        timestamp: DateTime<Utc>,
    },

    /// A worker claimed the job and is calling the import engine.
    JobStarted {
        job_id: JobId,
        kind: JobKind,
        timestamp: DateTime<Utc>,
    },

    /// The job reached its terminal result.
    JobFinished {
        job_id: JobId,
        kind: JobKind,
        status: JobStatus,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Confirmation Events
    // =========================================================================
    /// A running job asked for an overwrite decision.
    ConfirmationRequested {
        request_id: RequestId,
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },

    /// The overwrite decision was assigned.
    ConfirmationResolved {
        request_id: RequestId,
        job_id: JobId,
        outcome: ConfirmationOutcome,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Progress Events
    // =========================================================================
    /// A throttled progress update was handed to the interactive layer.
    ProgressRelayed {
        job_id: JobId,
        timestamp: DateTime<Utc>,
    },
}

impl BridgeEvent {
    /// JSON form used by the event log.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Broadcast channel for [`BridgeEvent`]s.
///
/// Cloning the bus shares the underlying channel. Publishing never blocks and
/// succeeds even when nobody is subscribed.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers that received it.
    pub fn emit(&self, event: BridgeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
