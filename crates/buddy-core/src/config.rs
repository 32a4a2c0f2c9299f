use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BuddyError, Result};

/// Environment variables that override the `[import]` section.
pub const ENV_PACKS_PATH: &str = "PACKS_PATH";
pub const ENV_COURSES_PATH: &str = "COURSES_PATH";
pub const ENV_SINGLES_FOLDER_NAME: &str = "SINGLES_FOLDER_NAME";
pub const ENV_CACHE_PATH: &str = "ITGMANIA_CACHE_PATH";
pub const ENV_ADD_SONG_CHANNEL_ID: &str = "ADD_SONG_CHANNEL_ID";

/// Upper bound on how long an overwrite prompt may stay open.
pub const MAX_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level configuration for the bot.
///
/// Loaded from `~/.itg-buddy/config.toml` by default. Every section falls
/// back to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuddyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub import: ImportSection,
}

impl BuddyConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BuddyConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Timing and capacity settings for the execution bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    /// Minimum gap between two progress updates for one job.
    pub progress_throttle_ms: u64,
    /// How long an overwrite prompt waits for the user.
    pub confirmation_timeout_secs: u64,
    /// Queued plus running jobs allowed per kind before submissions are rejected.
    pub max_queue_depth: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            progress_throttle_ms: 1000,
            confirmation_timeout_secs: 60,
            max_queue_depth: 32,
        }
    }
}

impl BridgeSection {
    pub fn progress_throttle(&self) -> Duration {
        Duration::from_millis(self.progress_throttle_ms)
    }

    /// Configured prompt timeout, capped at [`MAX_CONFIRMATION_TIMEOUT`].
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs).min(MAX_CONFIRMATION_TIMEOUT)
    }
}

/// Raw `[import]` section as written in the config file.
///
/// Every key is optional here; [`ImportSettings::resolve`] decides whether
/// the import subsystem can start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportSection {
    /// Directory holding installed packs.
    pub packs: Option<PathBuf>,
    /// Directory holding installed courses.
    pub courses: Option<PathBuf>,
    /// Name of the pack folder (under `packs`) that receives single songs.
    pub singles_folder_name: Option<String>,
    /// Game cache directory; stale entries are removed after a song import.
    pub cache: Option<PathBuf>,
    /// Channel whose `.zip` attachments are imported as songs.
    pub add_song_channel_id: Option<String>,
}

/// Validated import settings. Only constructed when every required key is
/// present and well formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSettings {
    pub packs: PathBuf,
    pub courses: PathBuf,
    pub singles: PathBuf,
    pub cache: Option<PathBuf>,
    pub add_song_channel_id: Option<u64>,
}

impl ImportSettings {
    /// Resolve settings from the file section, letting environment variables
    /// override individual keys.
    ///
    /// `env` is injected so callers and tests control the lookup.
    pub fn resolve<F>(section: &ImportSection, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        let packs = lookup(ENV_PACKS_PATH)
            .map(PathBuf::from)
            .or_else(|| section.packs.clone());
        let courses = lookup(ENV_COURSES_PATH)
            .map(PathBuf::from)
            .or_else(|| section.courses.clone());
        let singles_name =
            lookup(ENV_SINGLES_FOLDER_NAME).or_else(|| section.singles_folder_name.clone());
        let cache = lookup(ENV_CACHE_PATH)
            .map(PathBuf::from)
            .or_else(|| section.cache.clone());
        let channel = lookup(ENV_ADD_SONG_CHANNEL_ID).or_else(|| section.add_song_channel_id.clone());

        let mut missing = Vec::new();
        if packs.is_none() {
            missing.push(ENV_PACKS_PATH);
        }
        if courses.is_none() {
            missing.push(ENV_COURSES_PATH);
        }
        if singles_name.is_none() {
            missing.push(ENV_SINGLES_FOLDER_NAME);
        }
        for key in &missing {
            warn!(key = %key, "Missing required import setting");
        }

        let (Some(packs), Some(courses), Some(singles_name)) = (packs, courses, singles_name) else {
            return Err(BuddyError::Config(format!(
                "Missing keys: {}",
                missing.join(", ")
            )));
        };

        let add_song_channel_id = match channel {
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
                BuddyError::Config(format!("{} is not a channel id: {}", ENV_ADD_SONG_CHANNEL_ID, raw))
            })?),
            None => None,
        };

        Ok(Self {
            singles: packs.join(singles_name),
            packs,
            courses,
            cache,
            add_song_channel_id,
        })
    }

    /// Resolve settings from the process environment and the file section.
    pub fn from_env(section: &ImportSection) -> Result<Self> {
        Self::resolve(section, |key| std::env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ---- BuddyConfig ----

    #[test]
    fn test_default_config() {
        let config = BuddyConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.bridge.progress_throttle(), Duration::from_secs(1));
        assert_eq!(config.bridge.confirmation_timeout(), Duration::from_secs(60));
        assert_eq!(config.bridge.max_queue_depth, 32);
        assert!(config.import.packs.is_none());
    }

    #[test]
    fn test_load_valid_config() {
        let content = r#"
[general]
log_level = "debug"

[bridge]
progress_throttle_ms = 250
confirmation_timeout_secs = 30
max_queue_depth = 4

[import]
packs = "/srv/itg/Songs"
courses = "/srv/itg/Courses"
singles_folder_name = "Singles"
add_song_channel_id = "42"
"#;
        let file = create_temp_config(content);
        let config = BuddyConfig::load(file.path()).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.bridge.progress_throttle_ms, 250);
        assert_eq!(config.bridge.confirmation_timeout_secs, 30);
        assert_eq!(config.bridge.max_queue_depth, 4);
        assert_eq!(config.import.packs, Some(PathBuf::from("/srv/itg/Songs")));
        assert_eq!(config.import.singles_folder_name.as_deref(), Some("Singles"));
    }

    #[test]
    fn test_load_partial_config_uses_defaults() {
        let content = r#"
[bridge]
max_queue_depth = 2
"#;
        let file = create_temp_config(content);
        let config = BuddyConfig::load(file.path()).unwrap();
        assert_eq!(config.bridge.max_queue_depth, 2);
        assert_eq!(config.bridge.progress_throttle_ms, 1000);
        assert_eq!(config.general.log_level, "info");
    }

    #[test]
    fn test_load_invalid_toml_is_config_error() {
        let file = create_temp_config("[bridge\nmax_queue_depth = ");
        let err = BuddyConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, BuddyError::Config(_)));
    }

    #[test]
    fn test_confirmation_timeout_is_capped() {
        let section = BridgeSection {
            confirmation_timeout_secs: u64::MAX,
            ..BridgeSection::default()
        };
        assert_eq!(section.confirmation_timeout(), MAX_CONFIRMATION_TIMEOUT);
    }

    // ---- ImportSettings ----

    #[test]
    fn test_resolve_from_env_only() {
        let env = env_from(&[
            (ENV_PACKS_PATH, "/itg/Songs"),
            (ENV_COURSES_PATH, "/itg/Courses"),
            (ENV_SINGLES_FOLDER_NAME, "Singles"),
            (ENV_CACHE_PATH, "/itg/Cache"),
            (ENV_ADD_SONG_CHANNEL_ID, "123456789"),
        ]);
        let settings = ImportSettings::resolve(&ImportSection::default(), env).unwrap();
        assert_eq!(settings.packs, PathBuf::from("/itg/Songs"));
        assert_eq!(settings.courses, PathBuf::from("/itg/Courses"));
        assert_eq!(settings.singles, PathBuf::from("/itg/Songs/Singles"));
        assert_eq!(settings.cache, Some(PathBuf::from("/itg/Cache")));
        assert_eq!(settings.add_song_channel_id, Some(123456789));
    }

    #[test]
    fn test_env_overrides_file_section() {
        let section = ImportSection {
            packs: Some(PathBuf::from("/file/Songs")),
            courses: Some(PathBuf::from("/file/Courses")),
            singles_folder_name: Some("FileSingles".to_string()),
            cache: None,
            add_song_channel_id: None,
        };
        let env = env_from(&[(ENV_PACKS_PATH, "/env/Songs")]);
        let settings = ImportSettings::resolve(&section, env).unwrap();
        assert_eq!(settings.packs, PathBuf::from("/env/Songs"));
        assert_eq!(settings.courses, PathBuf::from("/file/Courses"));
        assert_eq!(settings.singles, PathBuf::from("/env/Songs/FileSingles"));
        assert!(settings.cache.is_none());
        assert!(settings.add_song_channel_id.is_none());
    }

    #[test]
    fn test_missing_keys_are_listed() {
        let env = env_from(&[(ENV_PACKS_PATH, "/itg/Songs")]);
        let err = ImportSettings::resolve(&ImportSection::default(), env).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(ENV_COURSES_PATH));
        assert!(msg.contains(ENV_SINGLES_FOLDER_NAME));
        assert!(!msg.contains(ENV_PACKS_PATH));
    }

    #[test]
    fn test_blank_env_value_counts_as_missing() {
        let env = env_from(&[
            (ENV_PACKS_PATH, "  "),
            (ENV_COURSES_PATH, "/c"),
            (ENV_SINGLES_FOLDER_NAME, "S"),
        ]);
        let err = ImportSettings::resolve(&ImportSection::default(), env).unwrap_err();
        assert!(err.to_string().contains(ENV_PACKS_PATH));
    }

    #[test]
    fn test_invalid_channel_id() {
        let env = env_from(&[
            (ENV_PACKS_PATH, "/p"),
            (ENV_COURSES_PATH, "/c"),
            (ENV_SINGLES_FOLDER_NAME, "S"),
            (ENV_ADD_SONG_CHANNEL_ID, "general"),
        ]);
        let err = ImportSettings::resolve(&ImportSection::default(), env).unwrap_err();
        assert!(matches!(err, BuddyError::Config(_)));
        assert!(err.to_string().contains("general"));
    }
}
