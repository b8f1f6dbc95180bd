//! Reader strategies: produce a Dataflow from the configured source.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use sluice_core::config::qualify_with_schema;
use sluice_core::dataflow::Dataflow;
use sluice_core::env;
use sluice_core::error::TaskError;
use sluice_core::drivers::{ApiConn, ApiStreamConfig, DbConn, FileStreamConfig};
use sluice_core::templates::render;
use tracing::debug;

use crate::worker::TaskWorker;

impl TaskWorker {
    /// Resolve the source stream into SQL and bulk-export it.
    ///
    /// `watermark` is the formatted incremental boundary value; empty
    /// means full load.
    pub(crate) async fn read_from_db(
        &mut self,
        conn: &DbConn,
        watermark: &str,
    ) -> Result<Dataflow> {
        let stream = self.config.source.stream.clone();
        let mut src_table = String::new();
        let mut fields_str = "*".to_string();
        let mut sql;

        // No whitespace and no '/': a table or view identifier.
        if !stream.contains(char::is_whitespace) && !stream.contains('/') {
            let schema = self
                .config
                .source
                .data
                .get("schema")
                .cloned()
                .unwrap_or_default();
            src_table = qualify_with_schema(&schema, &stream);
            if !self.config.source.columns.is_empty() {
                fields_str = self
                    .config
                    .source
                    .columns
                    .iter()
                    .map(|f| conn.quote(f))
                    .collect::<Vec<_>>()
                    .join(", ");
            }
            sql = format!("select {fields_str} from {src_table}");
        } else {
            sql = stream.clone();
        }

        // A stream ending in .sql refers to a file of SQL. If the file
        // is missing but the stream also parses as a table name, fall
        // back to the table and log the swallowed read error.
        if stream.to_lowercase().ends_with(".sql") {
            match resolve_sql_text(&stream) {
                Ok(text) => sql = text,
                Err(err) if src_table.is_empty() => {
                    return Err(err.context(format!("could not load sql for: {stream}")));
                }
                Err(err) => debug!("treating {stream} as a table, not a sql file: {err:#}"),
            }
        }

        // Probe for source columns with an always-false predicate.
        let probe = render(&sql, &[("incremental_where_cond", "1=0")]);
        let src_columns = conn
            .get_sql_columns(&probe)
            .await
            .context("could not obtain source columns")?;

        if self.config.using_checkpoint() {
            let mut condition = "1=1".to_string();
            if !watermark.is_empty() {
                let op = if self.flags.inclusive_boundary { ">=" } else { ">" };
                condition = format!(
                    "{} {op} {watermark}",
                    conn.quote(&src_columns.normalize(&self.config.source.update_key))
                );
            }
            if !src_table.is_empty() {
                sql = format!("select {fields_str} from {src_table} where {condition}");
            } else {
                if !sql.contains("{incremental_where_cond}") {
                    return Err(anyhow!(TaskError::IncrementalPlaceholderMissing));
                }
                sql = render(&sql, &[("incremental_where_cond", &condition)]);
            }
        } else if self.config.source.limit > 0 && !src_table.is_empty() {
            sql = render(
                conn.template().limit,
                &[
                    ("fields", fields_str.as_str()),
                    ("table", src_table.as_str()),
                    ("limit", &self.config.source.limit.to_string()),
                ],
            );
        }

        let df = conn
            .bulk_export(&sql)
            .await
            .with_context(|| format!("could not bulk export: {sql}"))?;
        if df.columns.is_empty() {
            bail!("could not read columns");
        }
        Ok(df)
    }

    /// Read from a filesystem URL, or CSV from stdin when none is set.
    pub(crate) async fn read_from_file(&mut self, watermark: &str) -> Result<Dataflow> {
        let df = if self.config.options.stdin || self.config.source.conn.url.is_empty() {
            sluice_io::stdio::read_stdin_dataflow(self.flags.sample_size).await?
        } else {
            let url = self.config.source.conn.url.clone();
            let props = self.file_props(watermark);
            let fs = match &self.fs {
                Some(fs) => fs.clone(),
                None => sluice_io::connect::filesystem_client(&url, &props)
                    .with_context(|| format!("could not obtain client for {url}"))?,
            };
            let cfg = FileStreamConfig {
                columns: self.config.source.columns.clone(),
                limit: self.config.source.limit,
            };
            fs.read_dataflow(&url, cfg).await?
        };
        if df.columns.is_empty() {
            bail!("could not read columns");
        }
        Ok(df)
    }

    /// Stream from an API connector, resuming at the watermark.
    pub(crate) async fn read_from_api(
        &mut self,
        client: &ApiConn,
        watermark: &str,
    ) -> Result<Dataflow> {
        let cfg = ApiStreamConfig {
            columns: self.config.source.columns.clone(),
            start_date: watermark.to_string(),
        };
        let stream = client
            .stream(&self.config.source.stream, cfg)
            .await
            .with_context(|| {
                format!(
                    "could not read stream '{}' for connection: {}",
                    self.config.source.stream,
                    client.name()
                )
            })?;
        let df = Dataflow::from_datastreams(vec![stream])?;
        if df.columns.is_empty() {
            bail!("could not read columns");
        }
        Ok(df)
    }

    /// Driver properties for a filesystem client: connection data and
    /// source options merged, plus the engine-controlled keys.
    fn file_props(&self, watermark: &str) -> BTreeMap<String, String> {
        let mut props = self.config.source.conn.data.clone();
        for (key, value) in &self.config.source.options {
            props.insert(key.clone(), json_to_prop(value));
        }
        if self.flags.metadata_loaded_at {
            props.insert(
                "SLING_LOADED_AT".to_string(),
                self.started_at.timestamp().to_string(),
            );
        }
        if self.flags.metadata_stream_url {
            props.insert("SLING_STREAM_URL".to_string(), "true".to_string());
        }
        if !watermark.is_empty() {
            props.insert(env::FS_TIMESTAMP_PROP.to_string(), watermark.to_string());
        }
        props.insert("SAMPLE_SIZE".to_string(), self.flags.sample_size.to_string());
        props.insert("SLING_PARALLEL".to_string(), self.flags.parallel.to_string());
        props
    }
}

/// Load SQL text, resolving a `.sql` file path (`file://` tolerated).
pub(crate) fn resolve_sql_text(reference: &str) -> Result<String> {
    let path = reference.strip_prefix("file://").unwrap_or(reference);
    if std::fs::metadata(path).is_err() {
        bail!("could not find file -> {path}");
    }
    std::fs::read_to_string(path).with_context(|| format!("could not read file: {path}"))
}

fn json_to_prop(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
