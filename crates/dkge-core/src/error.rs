//! Error types for dkge-core.

use thiserror::Error;

/// Error type for dataset, partitioning and sampling operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid flag combination or parameter value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A sampler was asked to draw from nothing.
    #[error("Sampling error: {0}")]
    Sampling(String),

    /// Dataset files are missing entries or malformed.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary encoding error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type for dkge-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_category() {
        let e = Error::Configuration("num_proc must be at least 1".into());
        assert_eq!(e.to_string(), "Configuration error: num_proc must be at least 1");

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "train.txt");
        assert!(matches!(Error::from(io), Error::Io(_)));
    }
}
