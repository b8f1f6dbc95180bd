//! The declarative job configuration and pipeline-type dispatch.
//!
//! A [`Config`] describes one extract-load task: where to read, where
//! to write, and under which load mode. The engine receives it already
//! deserialized and validated; everything here is plain data plus the
//! rules that derive a [`TaskType`] from it.
//!
//! # Example YAML Configuration
//!
//! ```yaml
//! source:
//!   conn:
//!     url: "postgres://host/db"
//!   stream: "public.orders"
//!   update_key: "create_dt"
//!   primary_key: ["id"]
//! target:
//!   conn:
//!     url: "mem://warehouse"
//!   object: "public.orders"
//!   mode: incremental
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// The immutable task description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub options: TaskOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub conn: ConnSpec,
    /// Table name, SQL text, `.sql` file path, URL, or API stream name.
    #[serde(default)]
    pub stream: String,
    /// Column selection; empty means all.
    #[serde(default)]
    pub columns: Vec<String>,
    /// High-watermark column for checkpointed loads.
    #[serde(default)]
    pub update_key: String,
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Row cap for table sources; 0 is unlimited.
    #[serde(default)]
    pub limit: u64,
    /// Driver passthrough options.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    /// Loose per-endpoint data (e.g. `schema`).
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(default)]
    pub conn: ConnSpec,
    /// Table name, URL, or SQL text to execute.
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub options: TargetOptions,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetOptions {
    /// Staging table name; derived from the target when empty.
    #[serde(default)]
    pub table_tmp: String,
    /// Explicit DDL for the final table, overriding inference.
    #[serde(default)]
    pub table_ddl: String,
    /// SQL (or `.sql` path) executed before staging.
    #[serde(default)]
    pub pre_sql: String,
    /// SQL (or `.sql` path) executed inside the promote transaction.
    #[serde(default)]
    pub post_sql: String,
    #[serde(default)]
    pub use_bulk: Option<bool>,
    /// Additively add columns missing on a pre-existing target.
    #[serde(default)]
    pub add_new_columns: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub stdout: bool,
}

/// How staged rows are promoted into the final object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[serde(alias = "drop")]
    FullRefresh,
    Truncate,
    Append,
    #[serde(alias = "upsert")]
    Incremental,
    Snapshot,
    Sql,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::FullRefresh => "full-refresh",
            Mode::Truncate => "truncate",
            Mode::Append => "append",
            Mode::Incremental => "incremental",
            Mode::Snapshot => "snapshot",
            Mode::Sql => "sql",
        };
        f.write_str(s)
    }
}

/// One of the seven pipeline variants the executor dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    DbSql,
    FileToDb,
    DbToDb,
    DbToFile,
    FileToFile,
    ApiToDb,
    ApiToFile,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::DbSql => "db-sql",
            TaskType::FileToDb => "file-db",
            TaskType::DbToDb => "db-db",
            TaskType::DbToFile => "db-file",
            TaskType::FileToFile => "file-file",
            TaskType::ApiToDb => "api-db",
            TaskType::ApiToFile => "api-file",
        };
        f.write_str(s)
    }
}

/// What kind of endpoint a connection spec points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    None,
    Database,
    File,
    Api,
}

const DB_SCHEMES: &[&str] = &[
    "postgres",
    "postgresql",
    "mysql",
    "oracle",
    "snowflake",
    "sqlserver",
    "mssql",
    "sqlite",
    "mem",
];

const FILE_SCHEMES: &[&str] = &["file", "s3", "gs", "gcs", "azure"];

const API_SCHEMES: &[&str] = &["airbyte", "api"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnSpec {
    #[serde(default)]
    pub url: String,
    /// Credentials and driver properties.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConnSpec {
    pub fn scheme(&self) -> Option<&str> {
        self.url.split_once("://").map(|(scheme, _)| scheme)
    }

    pub fn kind(&self) -> ConnKind {
        if self.url.is_empty() {
            return ConnKind::None;
        }
        match self.scheme() {
            Some(s) if DB_SCHEMES.contains(&s) => ConnKind::Database,
            Some(s) if API_SCHEMES.contains(&s) => ConnKind::Api,
            Some(s) if FILE_SCHEMES.contains(&s) => ConnKind::File,
            // A bare path is a local file reference.
            None => ConnKind::File,
            Some(_) => ConnKind::None,
        }
    }

    /// Short display name for progress lines.
    pub fn name(&self) -> String {
        self.scheme().unwrap_or("local").to_string()
    }

    pub fn is_database(&self) -> bool {
        self.kind() == ConnKind::Database
    }

    pub fn is_file(&self) -> bool {
        self.kind() == ConnKind::File
    }

    pub fn is_api(&self) -> bool {
        self.kind() == ConnKind::Api
    }
}

/// SQL text is anything with whitespace; table identifiers have none.
pub fn looks_like_sql(object: &str) -> bool {
    object.trim().chars().any(char::is_whitespace)
}

/// Prefix an unqualified identifier with a schema, when one is set.
pub fn qualify_with_schema(schema: &str, name: &str) -> String {
    if schema.is_empty() || name.is_empty() || name.contains('.') || looks_like_sql(name) {
        name.to_string()
    } else {
        format!("{schema}.{name}")
    }
}

impl Config {
    /// The effective load mode; unset defaults to append.
    pub fn mode(&self) -> Mode {
        self.target.mode.unwrap_or(Mode::Append)
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.target.mode = Some(mode);
    }

    /// Apply defaults before dispatch.
    pub fn set_default(&mut self) {
        if self.target.mode.is_none() && self.target.conn.is_database() {
            self.target.mode = Some(if looks_like_sql(&self.target.object) {
                Mode::Sql
            } else {
                Mode::Append
            });
        }
    }

    /// A checkpointed task computes a watermark before reading.
    pub fn using_checkpoint(&self) -> bool {
        !self.source.update_key.is_empty()
            && matches!(self.mode(), Mode::Incremental | Mode::Append)
    }

    /// Derive the pipeline variant from the endpoint kinds.
    pub fn task_type(&self) -> Result<TaskType, TaskError> {
        let src = if self.options.stdin {
            ConnKind::File
        } else {
            self.source.conn.kind()
        };
        let tgt = if self.options.stdout {
            ConnKind::File
        } else {
            self.target.conn.kind()
        };

        if tgt == ConnKind::Database
            && (self.target.mode == Some(Mode::Sql) || looks_like_sql(&self.target.object))
        {
            return Ok(TaskType::DbSql);
        }
        match (src, tgt) {
            (ConnKind::Api, ConnKind::Database) => Ok(TaskType::ApiToDb),
            (ConnKind::Api, ConnKind::File) => Ok(TaskType::ApiToFile),
            (ConnKind::File, ConnKind::Database) => Ok(TaskType::FileToDb),
            (ConnKind::Database, ConnKind::Database) => Ok(TaskType::DbToDb),
            (ConnKind::Database, ConnKind::File) => Ok(TaskType::DbToFile),
            (ConnKind::File, ConnKind::File) => Ok(TaskType::FileToFile),
            (src, tgt) => Err(TaskError::ConfigInvalid(format!(
                "cannot derive task type from source {src:?} and target {tgt:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(url: &str) -> ConnSpec {
        ConnSpec { url: url.to_string(), data: BTreeMap::new() }
    }

    fn config(src: &str, tgt: &str) -> Config {
        Config {
            source: SourceConfig { conn: conn(src), ..Default::default() },
            target: TargetConfig { conn: conn(tgt), object: "public.t1".into(), ..Default::default() },
            options: TaskOptions::default(),
        }
    }

    #[test]
    fn task_type_dispatch_table() {
        assert_eq!(
            config("postgres://h/db", "mem://wh").task_type().unwrap(),
            TaskType::DbToDb
        );
        assert_eq!(
            config("file:///tmp/in.csv", "mem://wh").task_type().unwrap(),
            TaskType::FileToDb
        );
        assert_eq!(
            config("postgres://h/db", "file:///tmp/out.csv").task_type().unwrap(),
            TaskType::DbToFile
        );
        assert_eq!(
            config("file:///a.csv", "file:///b.csv").task_type().unwrap(),
            TaskType::FileToFile
        );
        assert_eq!(
            config("airbyte://stripe", "mem://wh").task_type().unwrap(),
            TaskType::ApiToDb
        );
        assert_eq!(
            config("airbyte://stripe", "file:///out.csv").task_type().unwrap(),
            TaskType::ApiToFile
        );
    }

    #[test]
    fn sql_object_dispatches_db_sql() {
        let mut cfg = config("", "mem://wh");
        cfg.target.object = "update t1 set x = 1".into();
        assert_eq!(cfg.task_type().unwrap(), TaskType::DbSql);
    }

    #[test]
    fn stdin_stdout_count_as_files() {
        let mut cfg = config("", "mem://wh");
        cfg.options.stdin = true;
        assert_eq!(cfg.task_type().unwrap(), TaskType::FileToDb);

        let mut cfg = config("postgres://h/db", "");
        cfg.options.stdout = true;
        assert_eq!(cfg.task_type().unwrap(), TaskType::DbToFile);
    }

    #[test]
    fn mode_aliases_deserialize() {
        let cfg: Config = serde_yaml::from_str(
            "target:\n  conn:\n    url: mem://wh\n  object: t1\n  mode: upsert\n",
        )
        .unwrap();
        assert_eq!(cfg.mode(), Mode::Incremental);

        let cfg: Config = serde_yaml::from_str(
            "target:\n  conn:\n    url: mem://wh\n  object: t1\n  mode: drop\n",
        )
        .unwrap();
        assert_eq!(cfg.mode(), Mode::FullRefresh);
    }

    #[test]
    fn default_mode_is_append_for_db_targets() {
        let mut cfg = config("postgres://h/db", "mem://wh");
        cfg.set_default();
        assert_eq!(cfg.mode(), Mode::Append);
    }

    #[test]
    fn checkpoint_requires_update_key_and_mode() {
        let mut cfg = config("postgres://h/db", "mem://wh");
        cfg.source.update_key = "create_dt".into();
        cfg.set_mode(Mode::Incremental);
        assert!(cfg.using_checkpoint());
        cfg.set_mode(Mode::FullRefresh);
        assert!(!cfg.using_checkpoint());
        cfg.source.update_key.clear();
        cfg.set_mode(Mode::Append);
        assert!(!cfg.using_checkpoint());
    }

    #[test]
    fn schema_qualification() {
        assert_eq!(qualify_with_schema("public", "t1"), "public.t1");
        assert_eq!(qualify_with_schema("public", "other.t1"), "other.t1");
        assert_eq!(qualify_with_schema("", "t1"), "t1");
    }
}
