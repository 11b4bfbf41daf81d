//! Storage Error Hierarchy
//!
//! Errors surfaced by every [`crate::Storage`] implementation. Backend failures are
//! passed through unchanged in kind; the only translation done by this crate is
//! shaping backend responses into [`crate::Node`] trees.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No endpoint of the supplied set could be reached at construction time
    #[error("Cannot connect to coordination cluster: {}", endpoints.join(","))]
    InitializationFailure {
        endpoints: Vec<String>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Key does not exist (or its lease already elapsed)
    #[error("Key not found: {key}")]
    NotFound { key: String },

    /// Transport or protocol level failure talking to the backend
    #[error("Backend unavailable: {source}")]
    BackendUnavailable {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Watch subscription was rejected or could not be established
    #[error("Cannot watch {key}: {reason}")]
    SubscriptionFailure { key: String, reason: String },

    /// Value operation addressed a directory
    #[error("Not a file: {key}")]
    NotAFile { key: String },

    /// An ancestor of the key is a leaf
    #[error("Not a directory: {key}")]
    NotADirectory { key: String },

    /// Key failed normalisation
    #[error("Invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// Backend returned data that cannot be shaped into a node tree
    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Malformed backend response data
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("{field} of {key:?} is not valid UTF-8")]
    InvalidUtf8 { key: String, field: &'static str },

    #[error("Entry {key} is outside of subtree {root}")]
    OutsideRoot { root: String, key: String },

    #[error("Negative revision {revision} for {key}")]
    NegativeRevision { key: String, revision: i64 },
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Distinguishes "absent" from a real failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::NotAFile { .. } | Error::NotADirectory { .. })
    }
}

// ============== Conversion Implementations ============== //
impl From<etcd_client::Error> for Error {
    fn from(err: etcd_client::Error) -> Self {
        Error::BackendUnavailable {
            source: Box::new(err),
        }
    }
}
