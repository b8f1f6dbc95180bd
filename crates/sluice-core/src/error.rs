//! Engine error taxonomy.
//!
//! Fallible paths use `anyhow` with context wrapped at each boundary
//! (source name, sql, table). The kinds below exist where behavior
//! depends on the kind: recoverable no-files runs, the fatal temp-count
//! assertion, and the interruption verdict. Detection is by downcast
//! through the chain, never by message matching.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task configuration: {0}")]
    ConfigInvalid(String),

    /// Recoverable: an incremental file source with nothing new.
    #[error("found 0 files at {url}")]
    NoFilesFound { url: String },

    /// Data-loss surface: the staging table disagrees with the stream.
    #[error("inserted into temp table but table count ({table_count}) != stream count ({stream_count}). Records missing. Aborting")]
    TempCountMismatch { table_count: u64, stream_count: u64 },

    /// Warning unless the strict checksum flag is set.
    #[error("checksum failure on column {column}: stream {stream} != table {table}")]
    ChecksumMismatch { column: String, stream: u64, table: u64 },

    #[error("for incremental loading with custom SQL, include the where clause placeholder {{incremental_where_cond}}. e.g: select * from my_table where col2='A' AND {{incremental_where_cond}}")]
    IncrementalPlaceholderMissing,

    #[error("target for output is not specified")]
    NoTargetSpecified,

    /// The 5 s cancellation grace window expired.
    #[error("Execution interrupted")]
    Interrupted,

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

/// Whether `err` carries a given taxonomy kind anywhere in its chain,
/// including kinds attached as context.
pub fn has_kind(err: &anyhow::Error, pred: impl Fn(&TaskError) -> bool) -> bool {
    if err.downcast_ref::<TaskError>().is_some_and(&pred) {
        return true;
    }
    err.chain()
        .any(|cause| cause.downcast_ref::<TaskError>().is_some_and(&pred))
}

pub fn is_no_files_found(err: &anyhow::Error) -> bool {
    has_kind(err, |e| matches!(e, TaskError::NoFilesFound { .. }))
}
