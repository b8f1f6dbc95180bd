//! # Sluice Core
//!
//! Foundational types and abstractions for the Sluice extract-load
//! engine: the typed row model, the streaming [`Dataflow`] bridge, the
//! declarative job [`Config`], the driver contracts the engine
//! consumes endpoints through, and the dialect template registry.
//!
//! ## Key Components
//!
//! - **Value / Columns / Dataset**: row-oriented data model with CSV
//!   parsing, schema inference, and checksum accounting
//! - **Dataflow**: bounded-buffer producer/consumer bridge with shared
//!   counters, cancellation, and a set-once error slot
//! - **Config**: source/target/mode task description and the rules
//!   deriving one of the seven pipeline types from it
//! - **Driver contracts**: `DatabaseConnection`, `FileSystemClient`,
//!   and `ApiClient` traits consumed as `Arc<dyn ...>` handles
//! - **Templates**: dialect-specific SQL kept as data, not branches

pub mod columns;
pub mod config;
pub mod dataflow;
pub mod dataset;
pub mod drivers;
pub mod env;
pub mod error;
pub mod templates;
pub mod value;

pub use columns::{Column, ColumnType, Columns};
pub use config::{Config, ConnKind, ConnSpec, Mode, TaskType};
pub use dataflow::{Dataflow, Datastream, StreamWriter};
pub use dataset::Dataset;
pub use drivers::{ApiClient, ApiConn, DatabaseConnection, DbConn, FileSystemClient, FsClient};
pub use env::RuntimeFlags;
pub use error::TaskError;
pub use templates::Dialect;
pub use value::{Row, Value};
