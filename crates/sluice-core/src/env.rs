//! Process environment snapshot.
//!
//! Flags are read once at task construction and carried on the task as
//! a read-only snapshot, so mid-run environment changes cannot split a
//! task's behavior.

/// Metadata column holding the load epoch, when enabled.
pub const LOADED_AT_COLUMN: &str = "_sling_loaded_at";

/// Metadata column holding the originating file URL, when enabled.
pub const STREAM_URL_COLUMN: &str = "_sling_stream_url";

/// Property key a file source's watermark travels under.
pub const FS_TIMESTAMP_PROP: &str = "SLING_FS_TIMESTAMP";

const DEFAULT_SAMPLE_SIZE: usize = 900;

#[derive(Debug, Clone)]
pub struct RuntimeFlags {
    /// `SLING_LOADED_AT_COLUMN`: append `_sling_loaded_at` to rows.
    pub metadata_loaded_at: bool,
    /// `SLING_STREAM_URL_COLUMN`: append `_sling_stream_url` to rows.
    pub metadata_stream_url: bool,
    /// `SLING_FILE_ROW_LIMIT`: rows per output file; 0 is unlimited.
    pub file_row_limit: u64,
    /// `SLING_PARALLEL`: parallel bulk writes.
    pub parallel: bool,
    /// `SLING_GREATER_THAN_EQUAL`: incremental boundary is `>=` when
    /// true (the default), `>` when explicitly false.
    pub inclusive_boundary: bool,
    /// `ERROR_ON_CHECKSUM_FAILURE`: checksum mismatch becomes fatal.
    pub error_on_checksum_failure: bool,
    /// `SLING_CLI`: include operator hints in error messages.
    pub cli_hints: bool,
    /// `SAMPLE_SIZE`: rows sampled for schema inference and buffering.
    pub sample_size: usize,
    /// Permit altering a pre-existing target to fit the incoming data.
    pub table_schema_optimization: bool,
}

impl Default for RuntimeFlags {
    fn default() -> RuntimeFlags {
        RuntimeFlags {
            metadata_loaded_at: false,
            metadata_stream_url: false,
            file_row_limit: 0,
            parallel: true,
            inclusive_boundary: true,
            error_on_checksum_failure: false,
            cli_hints: false,
            sample_size: DEFAULT_SAMPLE_SIZE,
            table_schema_optimization: false,
        }
    }
}

impl RuntimeFlags {
    pub fn from_env() -> RuntimeFlags {
        let defaults = RuntimeFlags::default();
        RuntimeFlags {
            metadata_loaded_at: env_bool("SLING_LOADED_AT_COLUMN", defaults.metadata_loaded_at),
            metadata_stream_url: env_bool("SLING_STREAM_URL_COLUMN", defaults.metadata_stream_url),
            file_row_limit: env_parse("SLING_FILE_ROW_LIMIT", defaults.file_row_limit),
            parallel: env_bool("SLING_PARALLEL", defaults.parallel),
            inclusive_boundary: env_bool("SLING_GREATER_THAN_EQUAL", defaults.inclusive_boundary),
            error_on_checksum_failure: std::env::var("ERROR_ON_CHECKSUM_FAILURE")
                .map(|v| !v.is_empty())
                .unwrap_or(defaults.error_on_checksum_failure),
            cli_hints: env_bool("SLING_CLI", defaults.cli_hints),
            sample_size: env_parse("SAMPLE_SIZE", defaults.sample_size),
            table_schema_optimization: defaults.table_schema_optimization,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        let flags = RuntimeFlags::default();
        assert!(flags.inclusive_boundary);
        assert!(!flags.error_on_checksum_failure);
        assert_eq!(flags.file_row_limit, 0);
        assert_eq!(flags.sample_size, DEFAULT_SAMPLE_SIZE);
    }
}
