//! Crate-level error taxonomy.
//!
//! Version conflicts are the only error class the library ever absorbs
//! (into the commit retry loop). Everything else propagates to the caller
//! unchanged.

/// Error type shared by every fallible operation in the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid setup detected at construction time (bad table name,
    /// snapshots enabled without a blob store or frequency, and so on).
    /// Fatal; never retried.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A conditional write collided with a concurrent writer at the same
    /// (aggregate type, aggregate key, version). Retryable by design:
    /// the aggregate runtime rehydrates and retries when asked to.
    #[error("version conflict: {aggregate_type}:{aggregate_key} already has a commit at version {version}")]
    VersionConflict {
        /// Aggregate type of the contested commit.
        aggregate_type: String,
        /// Aggregate key of the contested commit.
        aggregate_key: String,
        /// The version the losing writer attempted to claim.
        version: u64,
    },

    /// A commit was requested while another commit on the same instance
    /// was still in flight. Never retried automatically.
    #[error("busy committing version {version}")]
    BusyCommitting {
        /// The version of the in-flight commit.
        version: u64,
    },

    /// The caller demanded an existing aggregate and none was found.
    #[error("{aggregate_type} with key '{aggregate_key}' does not exist")]
    AggregateNotFound {
        /// Requested aggregate type.
        aggregate_type: String,
        /// Requested aggregate key.
        aggregate_key: String,
    },

    /// The commit retry budget was consumed without a successful write.
    /// Carries the underlying conflict errors for diagnostics.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error from each failed attempt, in order.
        errors: Vec<Error>,
    },

    /// A required key property was absent and had no derivation function.
    #[error("missing required key property: {0}")]
    MissingKeyProperty(String),

    /// A commit record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A store or blob-store backend failure that is not a version
    /// conflict. Fatal to the current operation.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether this error is a retryable version conflict.
    ///
    /// This is the predicate the commit retry loop uses: conflicts are
    /// absorbed and retried, everything else surfaces immediately.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
