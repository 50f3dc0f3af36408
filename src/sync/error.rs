// ABOUTME: Typed error taxonomy for the sync pipeline
// ABOUTME: Separates fatal configuration errors from recoverable per-table conditions

use thiserror::Error;

/// Errors produced by the sync pipeline.
///
/// `Configuration` is fatal at startup. Every other variant is scoped to a
/// single table within a single cycle: the orchestrator logs it, records it
/// in the cycle stats, and retries on the next interval without touching
/// any other table.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid settings, detected before the first cycle.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The watermark store could not be read or written.
    #[error("watermark store unavailable: {0}")]
    StoreUnavailable(String),

    /// The table has no entry in the tracking registry. Not an error at the
    /// cycle level; surfaced as a warning while the table makes no progress.
    #[error("change tracking is not enabled for table '{0}'; register it in sync_tracking to resume")]
    TrackingDisabled(String),

    /// The stored watermark predates the retention floor, so the changes in
    /// between can no longer be retrieved.
    #[error("watermark {watermark} for table '{table}' predates the retention floor {min_valid_version}")]
    StaleAnchor {
        table: String,
        watermark: i64,
        min_valid_version: i64,
    },

    /// Transient failure talking to the source database.
    #[error("change reader error: {0}")]
    Reader(String),

    /// Transport or broker failure while delivering messages.
    #[error("publish error: {0}")]
    Publish(String),
}

impl From<tokio_postgres::Error> for SyncError {
    fn from(err: tokio_postgres::Error) -> Self {
        SyncError::Reader(err.to_string())
    }
}

impl From<lapin::Error> for SyncError {
    fn from(err: lapin::Error) -> Self {
        SyncError::Publish(err.to_string())
    }
}
