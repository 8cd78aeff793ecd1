use thiserror::Error;

use crate::reconciler::MirrorStats;

/// Errors raised while pulling the remote tree. Any of these aborts the run
/// before the first local mutation.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote API returned HTTP {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("unexpected response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

/// Errors from the local bookmark store primitives.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("node is not a folder: {0}")]
    NotAFolder(String),

    #[error("invalid move: {0}")]
    InvalidMove(String),
}

/// Outcome taxonomy for a mirror pull.
///
/// `AuthRequired` and `Fetch` happen before any local mutation. `LocalStore`
/// is the only variant that can occur mid-reconciliation; it carries the
/// stats accumulated up to the failure so the caller can report partial
/// progress. The next pull resumes from wherever this one stopped.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync already in progress.")]
    AlreadyRunning,

    #[error("Authentication required. Please reconnect your account.")]
    AuthRequired,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("local store operation failed: {source}")]
    LocalStore {
        #[source]
        source: StoreError,
        partial: MirrorStats,
    },

    #[error("failed to persist mirror state: {0}")]
    State(String),
}
