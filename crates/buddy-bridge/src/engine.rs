//! Contract of the import engine collaborator.
//!
//! The engine is blocking and not reentrant. The bridge guarantees that each
//! entry point is only ever called from its kind's single worker thread.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::types::Artifact;

/// Overwrite decision callback: `(new, existing) -> allow?`.
///
/// Called synchronously on the worker thread. Returning `false` must make the
/// engine abort with [`EngineError::OverwriteDenied`].
pub type OverwriteFn<'a> = &'a dyn Fn(&Artifact, &Artifact) -> bool;

/// Result of a successful pack import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackImport {
    pub pack: Artifact,
    pub course_count: usize,
}

/// Result of a successful song import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongImport {
    pub song: Artifact,
    /// Path of the installed simfile.
    pub stored_path: PathBuf,
}

/// Blocking import entry points.
///
/// Progress text goes to `progress`, which the caller supplies per call.
/// Engines must not write progress anywhere else.
pub trait ImportEngine: Send + Sync {
    fn add_pack(
        &self,
        source: &str,
        packs: &Path,
        courses: &Path,
        progress: &mut dyn Write,
        overwrite: OverwriteFn<'_>,
    ) -> Result<PackImport, EngineError>;

    fn add_song(
        &self,
        source: &str,
        singles: &Path,
        cache: Option<&Path>,
        progress: &mut dyn Write,
        overwrite: OverwriteFn<'_>,
    ) -> Result<SongImport, EngineError>;
}
