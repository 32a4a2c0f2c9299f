//! Execution bridge for import jobs.
//!
//! Serializes blocking import-engine calls per job kind, lets a running job
//! ask the interactive front end for an overwrite decision, and relays
//! throttled progress text back to the chat message that started the job.

pub mod confirmation;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod frontend;
pub mod progress;
pub mod respondable;
pub mod types;
pub mod worker;

pub use confirmation::{ConfirmationBridge, ConfirmationGate, ConfirmationResponder};
pub use dispatcher::{JobDispatcher, JobHandle};
pub use engine::{ImportEngine, OverwriteFn, PackImport, SongImport};
pub use error::{ConfirmationError, DeliveryError, DispatchError, EngineError, JobHandleError};
pub use frontend::{FrontEnd, FrontEndEvent, FrontEndReceiver, FrontEndSender};
pub use progress::{ProgressRelay, Throttle};
pub use respondable::Respondable;
pub use types::{
    Artifact, BridgeConfig, ConfirmationRequest, ImportJob, ImportTargets, JobResult, Payload,
    ProgressUpdate,
};
pub use worker::WorkerPool;
