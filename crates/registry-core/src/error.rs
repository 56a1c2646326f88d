//! Error types for the registry core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Registry core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization of a service snapshot or index fragment failed
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    /// A fragment carried a snapshot that does not decode to a service
    #[error("malformed snapshot for {name}@{version}: {source}")]
    MalformedSnapshot {
        name: String,
        version: String,
        #[source]
        source: postcard::Error,
    },
}
