//! Contracts the engine consumes endpoint drivers through.
//!
//! Driver implementations (real database clients, object stores, API
//! connectors) live outside the engine; the in-repo reference drivers
//! exist so the pipeline is runnable and testable end-to-end. Handles
//! are shared (`Arc<dyn ...>`) so cleanup closures can keep a driver
//! alive past the worker that opened it; implementations use interior
//! mutability for their session state.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::columns::Columns;
use crate::dataflow::{Dataflow, Datastream};
use crate::dataset::Dataset;
use crate::templates::{Dialect, DialectTemplates};

pub type DbConn = Arc<dyn DatabaseConnection>;
pub type FsClient = Arc<dyn FileSystemClient>;
pub type ApiConn = Arc<dyn ApiClient>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    Default,
    Serializable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub isolation: Isolation,
}

impl TxOptions {
    pub fn serializable() -> TxOptions {
        TxOptions { isolation: Isolation::Serializable }
    }
}

/// A database endpoint.
#[async_trait]
pub trait DatabaseConnection: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Display name for progress and error messages.
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn close(&self);

    /// Set a driver property (credentials, bulk toggles, metadata).
    fn set_prop(&self, key: &str, value: &str);

    /// Execute a statement, returning rows affected.
    async fn exec(&self, sql: &str) -> Result<u64>;

    /// Run a query eagerly.
    async fn query(&self, sql: &str) -> Result<Dataset>;

    /// Run a query as a streaming dataflow.
    async fn bulk_export(&self, sql: &str) -> Result<Dataflow>;

    /// Drain a dataflow into `table`, returning rows written. Runs
    /// inside the currently-open transaction when there is one.
    async fn bulk_import(&self, table: &str, df: &mut Dataflow) -> Result<u64>;

    async fn get_columns(&self, table: &str) -> Result<Columns>;

    /// Column metadata for an arbitrary query.
    async fn get_sql_columns(&self, sql: &str) -> Result<Columns>;

    async fn get_count(&self, table: &str) -> Result<u64>;

    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Tolerates a missing table.
    async fn drop_table(&self, table: &str) -> Result<()>;

    fn generate_ddl(&self, table: &str, columns: &Columns) -> Result<String>;

    /// Delete target rows matching any primary-key tuple present in
    /// `src_table`, then insert all of `src_table` (or the dialect's
    /// MERGE equivalent). Returns rows affected.
    async fn upsert(&self, src_table: &str, tgt_table: &str, primary_key: &[String])
        -> Result<u64>;

    /// Atomically exchange two tables by rename.
    async fn swap_table(&self, src_table: &str, tgt_table: &str) -> Result<()>;

    /// Alter a pre-existing table to fit the incoming column set.
    async fn optimize_table(&self, table: &str, columns: &Columns) -> Result<()>;

    /// Additively add columns missing on the table.
    async fn add_missing_columns(&self, table: &str, columns: &Columns) -> Result<()>;

    /// Compare per-column checksums reported by the stream against the
    /// table's contents.
    async fn compare_checksums(
        &self,
        table: &str,
        columns: &Columns,
        checksums: &[u64],
    ) -> Result<()>;

    async fn begin(&self, options: Option<TxOptions>) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    fn quote(&self, ident: &str) -> String {
        self.dialect().quote(ident)
    }

    fn template(&self) -> &'static DialectTemplates {
        self.dialect().templates()
    }
}

impl std::fmt::Debug for dyn DatabaseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnection").field("name", &self.name()).finish()
    }
}

/// Read options for a filesystem source.
#[derive(Debug, Clone, Default)]
pub struct FileStreamConfig {
    /// Column selection; empty means all.
    pub columns: Vec<String>,
    /// Total row cap; 0 is unlimited.
    pub limit: u64,
}

/// A file or object-store endpoint.
#[async_trait]
pub trait FileSystemClient: Send + Sync {
    async fn read_dataflow(&self, url: &str, cfg: FileStreamConfig) -> Result<Dataflow>;

    /// Returns bytes written.
    async fn write_dataflow(&self, df: &mut Dataflow, url: &str) -> Result<u64>;
}

/// Read options for an API stream.
#[derive(Debug, Clone, Default)]
pub struct ApiStreamConfig {
    pub columns: Vec<String>,
    /// Watermark handed to the connector as its starting point.
    pub start_date: String,
}

/// A streaming API endpoint (Airbyte-family connectors).
#[async_trait]
pub trait ApiClient: Send + Sync {
    fn name(&self) -> &str;

    async fn init(&self) -> Result<()>;

    async fn stream(&self, name: &str, cfg: ApiStreamConfig) -> Result<Datastream>;

    async fn close(&self);
}
