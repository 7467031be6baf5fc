use thiserror::Error;

/// Errors that can occur in dkge-kge.
#[derive(Error, Debug)]
pub enum Error {
    /// Dataset, partitioning or sampling error.
    #[error(transparent)]
    Core(#[from] dkge_core::Error),
    /// Invalid flag combination or parameter value.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// IO error (unwritable checkpoint path, missing run files, ...).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Binary encoding error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// A child process could not be started or exited abnormally.
    #[error("Process error: {0}")]
    Process(String),
    /// Malformed or unexpected message on the evaluation service channel.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether this is a configuration error, from either crate.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Core(dkge_core::Error::Configuration(_))
        )
    }
}

/// Result type alias for dkge-kge.
pub type Result<T> = std::result::Result<T, Error>;
