//! Import engine for sources already on local disk.
//!
//! Copies pack and song folders into the game's song tree. Remote links and
//! archives are rejected; fetching and extracting them is left to a fuller
//! engine behind the same trait.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use buddy_bridge::{Artifact, EngineError, ImportEngine, OverwriteFn, PackImport, SongImport};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Name of the folder inside a pack that holds its courses.
const COURSES_DIR: &str = "Courses";

/// Copies local pack and song folders into place.
#[derive(Debug, Default, Clone)]
pub struct LocalImportEngine;

impl LocalImportEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ImportEngine for LocalImportEngine {
    fn add_pack(
        &self,
        source: &str,
        packs: &Path,
        courses: &Path,
        progress: &mut dyn Write,
        overwrite: OverwriteFn<'_>,
    ) -> Result<PackImport, EngineError> {
        let src = local_source(source)?;
        let name = folder_name(&src)?;
        let dest = packs.join(&name);

        replace_existing(&Artifact::new(name.clone(), &src), &dest, overwrite)?;

        let course_dir = find_child_dir(&src, COURSES_DIR)?;
        let files = collect_files(&src, course_dir.as_deref())?;
        copy_tree(&src, &dest, &files, progress, &name)?;

        let course_count = match course_dir {
            Some(dir) => install_courses(&dir, &courses.join(&name))?,
            None => 0,
        };

        info!(pack = %name, files = files.len(), course_count, "Pack installed");
        Ok(PackImport {
            pack: Artifact::new(name, dest),
            course_count,
        })
    }

    fn add_song(
        &self,
        source: &str,
        singles: &Path,
        cache: Option<&Path>,
        progress: &mut dyn Write,
        overwrite: OverwriteFn<'_>,
    ) -> Result<SongImport, EngineError> {
        let src = local_source(source)?;
        let folder = folder_name(&src)?;
        let simfile = find_simfile(&src)?.ok_or_else(|| {
            EngineError::Failed(format!("No .sm or .ssc file found in {}", src.display()))
        })?;
        let title = read_title(&simfile).unwrap_or_else(|| folder.clone());
        let dest = singles.join(&folder);

        replace_existing(&Artifact::new(title.clone(), &src), &dest, overwrite)?;

        let files = collect_files(&src, None)?;
        copy_tree(&src, &dest, &files, progress, &title)?;

        if let Some(cache) = cache {
            invalidate_song_cache(cache, &dest);
        }

        let stored_path = match simfile.file_name() {
            Some(file) => dest.join(file),
            None => dest.clone(),
        };
        info!(song = %title, path = %stored_path.display(), "Song installed");
        Ok(SongImport {
            song: Artifact::new(title, dest),
            stored_path,
        })
    }
}

/// Accept only existing local directories.
fn local_source(source: &str) -> Result<PathBuf, EngineError> {
    let source = source.trim();
    if source.contains("://") {
        return Err(EngineError::UnsupportedSource(source.to_string()));
    }
    let path = PathBuf::from(source);
    let is_zip = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false);
    if is_zip {
        return Err(EngineError::UnsupportedSource(source.to_string()));
    }
    if !path.is_dir() {
        return Err(EngineError::Failed(format!(
            "{} is not a directory",
            path.display()
        )));
    }
    Ok(path)
}

fn folder_name(path: &Path) -> Result<String, EngineError> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| EngineError::Failed(format!("{} has no folder name", path.display())))
}

/// Ask before replacing `dest`; remove it once allowed.
fn replace_existing(new: &Artifact, dest: &Path, overwrite: OverwriteFn<'_>) -> Result<(), EngineError> {
    if !dest.exists() {
        return Ok(());
    }
    let existing = Artifact::new(new.name.clone(), dest);
    if !overwrite(new, &existing) {
        return Err(EngineError::OverwriteDenied);
    }
    debug!(path = %dest.display(), "Removing existing copy");
    fs::remove_dir_all(dest)?;
    Ok(())
}

fn find_child_dir(dir: &Path, name: &str) -> Result<Option<PathBuf>, EngineError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let matches = entry.file_name().to_string_lossy().eq_ignore_ascii_case(name);
        if matches && entry.file_type()?.is_dir() {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Files under `root` as relative paths, sorted, skipping `skip` entirely.
///
/// Symlinks are not followed.
fn collect_files(root: &Path, skip: Option<&Path>) -> Result<Vec<PathBuf>, EngineError> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| Some(e.path()) != skip);

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    Ok(files)
}

fn copy_tree(
    src: &Path,
    dest: &Path,
    files: &[PathBuf],
    progress: &mut dyn Write,
    label: &str,
) -> Result<(), EngineError> {
    fs::create_dir_all(dest)?;
    let total = files.len().max(1);
    for (i, relative) in files.iter().enumerate() {
        let target = dest.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src.join(relative), &target)?;
        write!(progress, "Copying {}: {:>3}%\r", label, (i + 1) * 100 / total)?;
        progress.flush()?;
    }
    Ok(())
}

/// Copy every `.crs` file in `dir` to `dest`. Returns how many were copied.
fn install_courses(dir: &Path, dest: &Path) -> Result<usize, EngineError> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_course = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("crs"))
            .unwrap_or(false);
        if !is_course {
            continue;
        }
        if let Some(file) = path.file_name() {
            fs::create_dir_all(dest)?;
            fs::copy(&path, dest.join(file))?;
            count += 1;
        }
    }
    Ok(count)
}

/// The song's simfile; `.ssc` is preferred over `.sm`.
fn find_simfile(dir: &Path) -> Result<Option<PathBuf>, EngineError> {
    let mut ssc = None;
    let mut sm = None;
    let mut entries = fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    for path in entries {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        match ext.as_deref() {
            Some("ssc") if ssc.is_none() => ssc = Some(path),
            Some("sm") if sm.is_none() => sm = Some(path),
            _ => {}
        }
    }
    Ok(ssc.or(sm))
}

/// Value of the `#TITLE:` tag, if present and non-empty.
fn read_title(simfile: &Path) -> Option<String> {
    let content = fs::read_to_string(simfile).ok()?;
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("#TITLE:"))
        .map(|value| value.trim().trim_end_matches(';').trim().to_string())
        .find(|title| !title.is_empty())
}

/// Path of the game's cache entry for an installed song folder.
///
/// The game keys song cache files by their path under `Songs/`, with the
/// separators replaced by underscores.
fn song_cache_entry(cache: &Path, song_dir: &Path) -> Option<PathBuf> {
    let song = song_dir.file_name()?.to_string_lossy().to_string();
    let pack = song_dir.parent()?.file_name()?.to_string_lossy().to_string();
    Some(cache.join("Songs").join(format!("Songs_{}_{}", pack, song)))
}

fn invalidate_song_cache(cache: &Path, song_dir: &Path) {
    let Some(entry) = song_cache_entry(cache, song_dir) else {
        return;
    };
    if !entry.exists() {
        return;
    }
    match fs::remove_file(&entry) {
        Ok(()) => debug!(path = %entry.display(), "Removed stale song cache entry"),
        Err(e) => warn!(path = %entry.display(), error = %e, "Failed to remove song cache entry"),
    }
}
