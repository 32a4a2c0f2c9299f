//! Value types flowing through the execution bridge.
//!
//! Defines jobs, confirmation requests, progress updates, terminal results
//! and the structured payloads handed to a [`Respondable`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use buddy_core::config::BridgeSection;
use buddy_core::types::{JobId, JobKind, JobStatus, RequestId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::respondable::Respondable;

// =============================================================================
// Jobs
// =============================================================================

/// Descriptor of an imported (or already installed) artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Display name: pack folder name or song title.
    pub name: String,
    /// Location on disk.
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Target directories for a job. The variant fixes the job's kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTargets {
    Pack { packs: PathBuf, courses: PathBuf },
    Song { singles: PathBuf, cache: Option<PathBuf> },
}

impl ImportTargets {
    pub fn kind(&self) -> JobKind {
        match self {
            ImportTargets::Pack { .. } => JobKind::Pack,
            ImportTargets::Song { .. } => JobKind::Song,
        }
    }
}

/// An import request. Immutable once built; the queue owns it until a worker
/// claims it.
pub struct ImportJob {
    pub id: JobId,
    /// URL or local path handed to the import engine.
    pub source: String,
    pub targets: ImportTargets,
    /// Where progress, prompts and the final result are posted.
    pub respondable: Arc<dyn Respondable>,
    /// The only user allowed to answer this job's overwrite prompts.
    pub user: UserId,
    pub submitted_at: DateTime<Utc>,
}

impl ImportJob {
    /// Build a job; the authorized user is taken from the respondable.
    pub fn new(
        source: impl Into<String>,
        targets: ImportTargets,
        respondable: Arc<dyn Respondable>,
    ) -> Self {
        let user = respondable.user().clone();
        Self {
            id: JobId::new(),
            source: source.into(),
            targets,
            respondable,
            user,
            submitted_at: Utc::now(),
        }
    }

    pub fn pack(
        source: impl Into<String>,
        packs: impl Into<PathBuf>,
        courses: impl Into<PathBuf>,
        respondable: Arc<dyn Respondable>,
    ) -> Self {
        let targets = ImportTargets::Pack {
            packs: packs.into(),
            courses: courses.into(),
        };
        Self::new(source, targets, respondable)
    }

    pub fn song(
        source: impl Into<String>,
        singles: impl Into<PathBuf>,
        cache: Option<PathBuf>,
        respondable: Arc<dyn Respondable>,
    ) -> Self {
        let targets = ImportTargets::Song {
            singles: singles.into(),
            cache,
        };
        Self::new(source, targets, respondable)
    }

    pub fn kind(&self) -> JobKind {
        self.targets.kind()
    }
}

impl fmt::Debug for ImportJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportJob")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("targets", &self.targets)
            .field("user", &self.user)
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

/// Terminal result of a job. Produced exactly once per accepted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The engine returned normally. `count` is the number of courses for a
    /// pack and 1 for a song.
    Success { artifact: Artifact, count: usize },
    /// An overwrite was declined or its prompt expired.
    Cancelled,
    /// The engine failed; carries the original error text.
    Failed(String),
}

impl JobResult {
    pub fn status(&self) -> JobStatus {
        match self {
            JobResult::Success { .. } => JobStatus::Succeeded,
            JobResult::Cancelled => JobStatus::Cancelled,
            JobResult::Failed(_) => JobStatus::Failed,
        }
    }
}

// =============================================================================
// Confirmation & Progress
// =============================================================================

/// A running job's question: may `new` replace `existing`?
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub id: RequestId,
    pub job_id: JobId,
    pub kind: JobKind,
    pub new: Artifact,
    pub existing: Artifact,
    /// Only this user's answer resolves the request.
    pub user: UserId,
    /// Monotonic deadline used for waiting.
    pub deadline: Instant,
    /// Wall-clock form of `deadline`, for display.
    pub expires_at: DateTime<Utc>,
}

/// One throttled chunk of engine output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub text: String,
    pub emitted_at: DateTime<Utc>,
}

// =============================================================================
// Payloads
// =============================================================================

/// Structured content posted to a [`Respondable`].
///
/// Rendering (embeds, colours, buttons) is up to the respondable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Thinking,
    Progress {
        text: String,
    },
    OverwritePrompt {
        request_id: RequestId,
        kind: JobKind,
        new: Artifact,
        existing: Artifact,
        user: UserId,
        expires_at: DateTime<Utc>,
    },
    Cancelled,
    Error {
        message: String,
    },
    PackAdded {
        pack: Artifact,
        course_count: usize,
        added_by: UserId,
    },
    SongAdded {
        song: Artifact,
        added_by: UserId,
    },
}

impl Payload {
    pub fn overwrite_prompt(request: &ConfirmationRequest) -> Self {
        Payload::OverwritePrompt {
            request_id: request.id,
            kind: request.kind,
            new: request.new.clone(),
            existing: request.existing.clone(),
            user: request.user.clone(),
            expires_at: request.expires_at,
        }
    }

    /// Headline for the message, independent of the platform.
    pub fn title(&self) -> String {
        match self {
            Payload::Thinking => "Processing command...".to_string(),
            Payload::Progress { .. } => "Downloading...".to_string(),
            Payload::OverwritePrompt { kind, .. } => format!("Overwrite existing {}?", kind),
            Payload::Cancelled => "Overwrite Cancelled".to_string(),
            Payload::Error { .. } => "An Error Occurred".to_string(),
            Payload::PackAdded { pack, .. } => format!("Added {}", pack.name),
            Payload::SongAdded { song, .. } => {
                // stored path is <pack>/<song folder>/<simfile>
                let folder = song
                    .path
                    .parent()
                    .and_then(|p| p.parent())
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().to_string());
                match folder {
                    Some(folder) => format!("Added {} to {}", song.name, folder),
                    None => format!("Added {}", song.name),
                }
            }
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Runtime settings for the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub progress_throttle: Duration,
    pub confirmation_timeout: Duration,
    pub max_queue_depth: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from(&BridgeSection::default())
    }
}

impl From<&BridgeSection> for BridgeConfig {
    fn from(section: &BridgeSection) -> Self {
        Self {
            progress_throttle: section.progress_throttle(),
            confirmation_timeout: section.confirmation_timeout(),
            max_queue_depth: section.max_queue_depth.max(1),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
