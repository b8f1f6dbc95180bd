//! # Sluice I/O
//!
//! Endpoint implementations consumed through the driver contracts in
//! `sluice-core`:
//!
//! - **Local filesystem**: CSV files and directories, with glob
//!   matching, modification-time watermarks, and partitioned output
//! - **Stdio**: CSV over standard input/output
//! - **In-memory database**: a reference `DatabaseConnection` with
//!   snapshot transactions, reachable at `mem://` URLs
//! - **Scripted API client**: named static streams for the API paths
//!
//! Real database and object-store drivers are external; the factories
//! in [`connect`] resolve what this repo ships and report everything
//! else as not implemented.

/// Connection factories keyed by URL scheme
pub mod connect;

/// In-memory reference database driver
pub mod db_mem;

/// Local filesystem CSV client
pub mod fs_local;

/// Scripted API client
pub mod api;

/// CSV over stdin/stdout
pub mod stdio;

pub use api::ScriptedApiClient;
pub use db_mem::MemoryConnection;
pub use fs_local::LocalFsClient;
