use thiserror::Error;

/// Top-level error type for the bot.
///
/// Subsystem crates define their own error types for job-level failures.
/// This type covers the failures that happen around them: loading
/// configuration, touching the filesystem and serializing events.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuddyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for BuddyError {
    fn from(err: toml::de::Error) -> Self {
        BuddyError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for BuddyError {
    fn from(err: serde_json::Error) -> Self {
        BuddyError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for bot-level operations.
pub type Result<T> = std::result::Result<T, BuddyError>;
