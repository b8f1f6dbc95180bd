use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use sluice_core::config::{qualify_with_schema, Config, Mode, TaskType};
use sluice_core::dataflow::Dataflow;
use sluice_core::env::{self, RuntimeFlags};
use sluice_core::error::{is_no_files_found, TaskError};
use sluice_core::drivers::{ApiConn, DbConn, FsClient};

use crate::incremental::{self, WatermarkLayouts};
use crate::progress::rate_str;
use crate::task::{TaskExecution, TaskState};

/// One pipeline run. Owns cheap clones of everything the pipeline
/// needs so it can live on a spawned task while the executor waits.
pub(crate) struct TaskWorker {
    pub config: Config,
    pub task_type: TaskType,
    pub flags: RuntimeFlags,
    pub state: Arc<TaskState>,
    pub started_at: DateTime<Utc>,
    pub src_db: Option<DbConn>,
    pub tgt_db: Option<DbConn>,
    pub fs: Option<FsClient>,
    pub api: Option<ApiConn>,
}

impl TaskWorker {
    pub fn new(task: &mut TaskExecution) -> TaskWorker {
        TaskWorker {
            config: task.config.clone(),
            task_type: task.task_type,
            flags: task.flags.clone(),
            state: task.state(),
            started_at: task.started_at.unwrap_or_else(Utc::now),
            src_db: task.src_db.take(),
            tgt_db: task.tgt_db.take(),
            fs: task.fs.take(),
            api: task.api.take(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        match self.task_type {
            TaskType::DbSql => self.run_db_sql().await,
            TaskType::FileToDb => self.run_file_to_db().await,
            TaskType::DbToDb => self.run_db_to_db().await,
            TaskType::DbToFile => self.run_db_to_file().await,
            TaskType::FileToFile => self.run_file_to_file().await,
            TaskType::ApiToDb => self.run_api_to_db().await,
            TaskType::ApiToFile => self.run_api_to_file().await,
        }
    }

    // ---- connection helpers -------------------------------------------------

    fn src_db_conn(&mut self) -> Result<DbConn> {
        let conn = match self.src_db.take() {
            Some(conn) => conn,
            None => sluice_io::connect::database_client(&self.config.source.conn)
                .context("could not initialize source connection")?,
        };
        for (key, value) in &self.config.source.conn.data {
            conn.set_prop(key, value);
        }
        Ok(conn)
    }

    fn tgt_db_conn(&mut self) -> Result<DbConn> {
        let conn = match self.tgt_db.take() {
            Some(conn) => conn,
            None => sluice_io::connect::database_client(&self.config.target.conn)
                .context("could not initialize target connection")?,
        };
        for (key, value) in &self.config.target.conn.data {
            conn.set_prop(key, value);
        }
        if self.config.target.options.use_bulk == Some(false) {
            conn.set_prop("use_bulk", "false");
            conn.set_prop("allow_bulk_import", "false");
        }
        Ok(conn)
    }

    /// Connect and register the close on the cleanup stack, so every
    /// exit path releases the connection.
    async fn connect_db(&self, conn: &DbConn, which: &str) -> Result<()> {
        self.state
            .set_progress(format!("connecting to {which} database ({})", conn.name()));
        conn.connect()
            .await
            .with_context(|| format!("could not connect to: {}", conn.name()))?;
        let handle = conn.clone();
        self.state
            .add_cleanup(Box::new(move || {
                Box::pin(async move { handle.close().await })
            }))
            .await;
        Ok(())
    }

    /// Tie a freshly-read dataflow to the task: expose its counters,
    /// propagate task cancellation into it, and close it on cleanup.
    pub(crate) async fn adopt_flow(&self, df: &Dataflow) {
        self.state.attach_flow(df.stats());
        let flow_cancel = df.cancel_token();
        let task_cancel = self.state.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => flow_cancel.cancel(),
                _ = flow_cancel.cancelled() => {}
            }
        });
        let flow_cancel = df.cancel_token();
        self.state
            .add_cleanup(Box::new(move || {
                Box::pin(async move { flow_cancel.cancel() })
            }))
            .await;
    }

    fn qualify_target_names(&mut self) {
        let schema = self
            .config
            .target
            .data
            .get("schema")
            .cloned()
            .unwrap_or_default();
        self.config.target.object = qualify_with_schema(&schema, &self.config.target.object);
        self.config.target.options.table_tmp =
            qualify_with_schema(&schema, &self.config.target.options.table_tmp);
    }

    // ---- pipelines ----------------------------------------------------------

    async fn run_db_sql(&mut self) -> Result<()> {
        let tgt = self.tgt_db_conn()?;
        self.connect_db(&tgt, "target").await?;

        self.state.set_progress("executing sql on target database");
        let affected = tgt
            .exec(&self.config.target.object)
            .await
            .with_context(|| format!("could not complete sql execution on {}", tgt.name()))?;
        self.state.set_progress(format!("{affected} rows affected"));
        Ok(())
    }

    async fn run_db_to_file(&mut self) -> Result<()> {
        let start = Instant::now();
        let src = self.src_db_conn()?;
        self.connect_db(&src, "source").await?;

        self.state.set_progress("reading from source database");
        let mut df = self
            .read_from_db(&src, "")
            .await
            .context("could not read from database")?;
        self.adopt_flow(&df).await;

        if self.config.options.stdout {
            self.state.set_progress("writing to target stream (stdout)");
        } else {
            self.state.set_progress(format!(
                "writing to target file system ({})",
                self.config.target.conn.name()
            ));
        }
        let cnt = self
            .write_to_file(&mut df)
            .await
            .context("could not write to file")?;
        self.state
            .set_progress(format!("wrote {cnt} rows [{} r/s]", rate_str(cnt, start)));

        if let Some(err) = df.take_err() {
            return Err(err);
        }
        Ok(())
    }

    async fn run_file_to_file(&mut self) -> Result<()> {
        let start = Instant::now();
        if self.config.options.stdin {
            self.state.set_progress("reading from stream (stdin)");
        } else {
            self.state.set_progress(format!(
                "reading from source file system ({})",
                self.config.source.conn.name()
            ));
        }
        let mut df = match self.read_from_file("").await {
            Ok(df) => df,
            Err(err) if is_no_files_found(&err) => {
                self.state.set_progress("no files found");
                return Ok(());
            }
            Err(err) => return Err(err.context("could not read from file")),
        };
        self.adopt_flow(&df).await;

        if self.config.options.stdout {
            self.state.set_progress("writing to target stream (stdout)");
        } else {
            self.state.set_progress(format!(
                "writing to target file system ({})",
                self.config.target.conn.name()
            ));
        }
        let cnt = self
            .write_to_file(&mut df)
            .await
            .context("could not write to file")?;
        self.state
            .set_progress(format!("wrote {cnt} rows [{} r/s]", rate_str(cnt, start)));

        if let Some(err) = df.take_err() {
            return Err(err);
        }
        Ok(())
    }

    async fn run_file_to_db(&mut self) -> Result<()> {
        let start = Instant::now();
        let tgt = self.tgt_db_conn()?;
        self.connect_db(&tgt, "target").await?;

        let mut watermark = String::new();
        if self.config.using_checkpoint() {
            self.state.set_progress("getting checkpoint value");
            // File watermarks ride on the load-epoch metadata column.
            self.config.source.update_key = env::LOADED_AT_COLUMN.to_string();
            watermark = incremental::get_incremental_value(
                &tgt,
                &self.config.target.object,
                &self.config.source.update_key,
                &WatermarkLayouts::raw(),
            )
            .await
            .context("could not get incremental value")?;
        }

        if self.config.options.stdin {
            self.state.set_progress("reading from stream (stdin)");
        } else {
            self.state.set_progress(format!(
                "reading from source file system ({})",
                self.config.source.conn.name()
            ));
        }
        let mut df = match self.read_from_file(&watermark).await {
            Ok(df) => df,
            Err(err) if is_no_files_found(&err) => {
                if self.config.using_checkpoint() && !watermark.is_empty() {
                    self.state.set_progress(format!(
                        "no new files found since latest timestamp ({})",
                        format_epoch(&watermark)
                    ));
                } else {
                    self.state.set_progress("no files found");
                }
                return Ok(());
            }
            Err(err) => return Err(err.context("could not read from file")),
        };
        self.adopt_flow(&df).await;

        self.qualify_target_names();
        self.state
            .set_progress(format!("writing to target database [mode: {}]", self.config.mode()));
        let cnt = self
            .write_to_db(&mut df, &tgt)
            .await
            .context("could not write to database")?;

        let elapsed = start.elapsed().as_secs();
        self.state.set_progress(format!(
            "inserted {cnt} rows in {elapsed} secs [{} r/s]",
            rate_str(cnt, start)
        ));
        Ok(())
    }

    async fn run_db_to_db(&mut self) -> Result<()> {
        let start = Instant::now();
        if self.config.target.mode.is_none() {
            self.config.set_mode(Mode::Append);
        }

        let src = self.src_db_conn()?;
        let tgt = self.tgt_db_conn()?;
        self.connect_db(&src, "source").await?;
        self.connect_db(&tgt, "target").await?;

        self.qualify_target_names();

        let mut watermark = String::new();
        if self.config.using_checkpoint() {
            self.state.set_progress("getting checkpoint value");
            watermark = incremental::get_incremental_value(
                &tgt,
                &self.config.target.object,
                &self.config.source.update_key,
                &WatermarkLayouts::from_dialect(src.dialect()),
            )
            .await
            .context("could not get incremental value")?;
        }

        self.state.set_progress("reading from source database");
        let mut df = self
            .read_from_db(&src, &watermark)
            .await
            .context("could not read from database")?;
        self.adopt_flow(&df).await;

        // Direct-load hint: the flow is also staged at a file URL.
        if let Some(fs_url) = df.fs_url.clone() {
            self.config
                .source
                .data
                .insert("SOURCE_FILE".to_string(), fs_url);
        }

        self.state
            .set_progress(format!("writing to target database [mode: {}]", self.config.mode()));
        let cnt = self
            .write_to_db(&mut df, &tgt)
            .await
            .context("could not write to database")?;

        let bytes_str = match self.bytes_str(&df) {
            Some(s) => format!(" [{s}]"),
            None => String::new(),
        };
        let elapsed = start.elapsed().as_secs();
        self.state.set_progress(format!(
            "inserted {cnt} rows in {elapsed} secs [{} r/s]{bytes_str}",
            rate_str(cnt, start)
        ));
        Ok(())
    }

    async fn run_api_to_db(&mut self) -> Result<()> {
        let start = Instant::now();
        self.state.set_progress(format!(
            "connecting to source api system ({})",
            self.config.source.conn.name()
        ));
        let client = self.api_conn()?;
        client
            .init()
            .await
            .with_context(|| format!("could not init connection for: {}", client.name()))?;
        let handle = client.clone();
        self.state
            .add_cleanup(Box::new(move || {
                Box::pin(async move { handle.close().await })
            }))
            .await;

        let tgt = self.tgt_db_conn()?;
        self.connect_db(&tgt, "target").await?;

        self.qualify_target_names();

        let mut watermark = String::new();
        if self.config.using_checkpoint() {
            self.state.set_progress("getting checkpoint value");
            watermark = incremental::get_incremental_value(
                &tgt,
                &self.config.target.object,
                &self.config.source.update_key,
                &WatermarkLayouts::iso_raw(),
            )
            .await
            .context("could not get incremental value")?;
        }

        self.state.set_progress(format!(
            "reading from source api system ({})",
            self.config.source.conn.name()
        ));
        let mut df = self
            .read_from_api(&client, &watermark)
            .await
            .context("could not read from api")?;
        self.adopt_flow(&df).await;

        self.state
            .set_progress(format!("writing to target database [mode: {}]", self.config.mode()));
        let cnt = self
            .write_to_db(&mut df, &tgt)
            .await
            .context("could not write to database")?;

        let elapsed = start.elapsed().as_secs();
        self.state.set_progress(format!(
            "inserted {cnt} rows in {elapsed} secs [{} r/s]",
            rate_str(cnt, start)
        ));
        Ok(())
    }

    async fn run_api_to_file(&mut self) -> Result<()> {
        let start = Instant::now();
        self.state.set_progress(format!(
            "connecting to source api system ({})",
            self.config.source.conn.name()
        ));
        let client = self.api_conn()?;
        client
            .init()
            .await
            .with_context(|| format!("could not init connection for: {}", client.name()))?;
        let handle = client.clone();
        self.state
            .add_cleanup(Box::new(move || {
                Box::pin(async move { handle.close().await })
            }))
            .await;

        self.state.set_progress(format!(
            "reading from source api system ({})",
            self.config.source.conn.name()
        ));
        let mut df = self
            .read_from_api(&client, "")
            .await
            .context("could not read from api")?;
        self.adopt_flow(&df).await;

        if self.config.options.stdout {
            self.state.set_progress("writing to target stream (stdout)");
        } else {
            self.state.set_progress(format!(
                "writing to target file system ({})",
                self.config.target.conn.name()
            ));
        }
        let cnt = self
            .write_to_file(&mut df)
            .await
            .context("could not write to file")?;
        self.state
            .set_progress(format!("wrote {cnt} rows [{} r/s]", rate_str(cnt, start)));

        if let Some(err) = df.take_err() {
            return Err(err);
        }
        Ok(())
    }

    fn api_conn(&mut self) -> Result<ApiConn> {
        if let Some(client) = self.api.take() {
            return Ok(client);
        }
        match self.config.source.conn.scheme() {
            Some("airbyte") => Err(anyhow!(TaskError::NotImplemented(
                "airbyte connectors are external to this build".to_string()
            ))),
            other => Err(anyhow!(TaskError::NotImplemented(format!(
                "API type not implemented: {}",
                other.unwrap_or("unknown")
            )))),
        }
    }

    fn bytes_str(&self, df: &Dataflow) -> Option<String> {
        let (in_bytes, _) = df.bytes();
        (in_bytes > 0).then(|| ByteSize(in_bytes).to_string())
    }
}

/// Render an epoch-seconds watermark as a readable timestamp.
fn format_epoch(raw: &str) -> String {
    raw.parse::<i64>()
        .ok()
        .and_then(|epoch| DateTime::<Utc>::from_timestamp(epoch, 0))
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_formatting_falls_back_to_raw() {
        assert_eq!(format_epoch("not-a-number"), "not-a-number");
        assert!(format_epoch("1600000000").starts_with("2020-09-13"));
    }
}
