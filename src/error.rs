use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ApplyError>;

/// Structured status codes surfaced by the apply pipeline.
///
/// Retry and tolerate policies are driven by the classification helpers
/// below rather than by string matching at call sites.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("write conflict")]
    WriteConflict,

    #[error("bad value: {0}")]
    BadValue(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("cannot index parallel arrays")]
    CannotIndexParallelArrays,

    #[error("oplog out of order: {0}")]
    OplogOutOfOrder(String),

    #[error("attempting to replicate operations while primary")]
    CannotApplyOplogWhilePrimary,

    #[error("no operations provided to multi_apply")]
    EmptyBatch,

    #[error("expected oplog version {expected} but found version {found}")]
    UnsupportedOplogVersion { expected: i64, found: i64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("can no longer reach sync source {host} after {attempts} attempts")]
    SyncSourceExhausted { host: String, attempts: u32 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl ApplyError {
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, ApplyError::WriteConflict)
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ApplyError::Network(_))
    }

    /// Errors tolerated on CRUD ops during initial sync: the owning
    /// namespace will be cloned or dropped before initial sync completes.
    pub fn is_benign_for_initial_sync(&self) -> bool {
        matches!(
            self,
            ApplyError::NamespaceNotFound(_) | ApplyError::CannotIndexParallelArrays
        )
    }
}

/// Unrecoverable failure: log and terminate the process.
///
/// Interior functions return `Result` so policies stay testable; the fatal
/// decision lives only at the loop boundaries that call this.
pub fn fatal(msg: &str) -> ! {
    error!("fatal replication error: {msg}");
    std::process::abort();
}
