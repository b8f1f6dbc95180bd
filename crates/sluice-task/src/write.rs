//! Writer strategies: drain a Dataflow into files, stdout, or a
//! database via the staging-and-promote protocol.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use bytesize::ByteSize;
use chrono::Utc;
use rand::Rng;
use sluice_core::dataflow::Dataflow;
use sluice_core::error::TaskError;
use sluice_core::drivers::{DbConn, TxOptions};
use sluice_core::templates::substitute_date_tokens;
use tracing::{debug, warn};

use crate::promote;
use crate::read::resolve_sql_text;
use crate::worker::TaskWorker;

impl TaskWorker {
    /// Write to a filesystem URL or stdout. Returns rows written.
    pub(crate) async fn write_to_file(&mut self, df: &mut Dataflow) -> Result<u64> {
        if !self.config.target.conn.url.is_empty() && !self.config.options.stdout {
            // Date tokens enable partitioned output paths.
            let url = substitute_date_tokens(&self.config.target.conn.url, Utc::now());
            let mut props: BTreeMap<String, String> = self.config.target.conn.data.clone();
            props.insert(
                "SLING_FILE_ROW_LIMIT".to_string(),
                self.flags.file_row_limit.to_string(),
            );
            props.insert("SLING_PARALLEL".to_string(), self.flags.parallel.to_string());
            let fs = match &self.fs {
                Some(fs) => fs.clone(),
                None => sluice_io::connect::filesystem_client(&url, &props)
                    .with_context(|| format!("could not obtain client for: {url}"))?,
            };
            let bytes = fs
                .write_dataflow(df, &url)
                .await
                .context("could not write dataflow to file system")?;
            let cnt = df.count();
            debug!("wrote {} : {cnt} rows", ByteSize(bytes));
            Ok(cnt)
        } else if self.config.options.stdout {
            let stream = df.merge();
            let (rows, bytes) = sluice_io::stdio::write_stdout_stream(stream)
                .await
                .context("could not write to stdout")?;
            df.add_out_bytes(bytes);
            Ok(rows)
        } else {
            Err(anyhow!(TaskError::NoTargetSpecified))
        }
    }

    /// The staging-and-promote protocol: load the full dataflow into a
    /// temp table, assert parity, then promote into the target under
    /// the configured mode inside one transaction. A failure after the
    /// promote transaction opens leaves the target at its pre-task
    /// state; the temp table is dropped by the cleanup stack.
    pub(crate) async fn write_to_db(&mut self, df: &mut Dataflow, tgt: &DbConn) -> Result<u64> {
        let target_table = self.config.target.object.clone();

        // 1. Derive the temp-table name, within the dialect's
        // identifier cap.
        if self.config.target.options.table_tmp.is_empty() {
            let mut tmp = target_table.clone();
            let cap = tgt.template().max_identifier_length;
            if cap > 0 {
                if tmp.len() > cap - 6 {
                    tmp.truncate(cap - 6);
                }
                tmp.push_str("_tmp");
                tmp.push(rand_digit());
                tmp.push(rand_lower_alnum());
            } else {
                tmp.push_str("_tmp");
            }
            self.config.target.options.table_tmp = tmp;
        }
        let tmp_table = self.config.target.options.table_tmp.clone();

        // 2. Pre-SQL.
        let pre_sql = self.config.target.options.pre_sql.clone();
        if !pre_sql.is_empty() {
            self.state.set_progress("executing pre-sql");
            let sql = if pre_sql.to_lowercase().ends_with(".sql") {
                resolve_sql_text(&pre_sql).context("could not get pre-sql body")?
            } else {
                pre_sql
            };
            tgt.exec(&sql)
                .await
                .context("could not execute pre-sql on target")?;
        }

        // 3. Reset the temp table and register its drop for every
        // exit path, including cancellation.
        tgt.drop_table(&tmp_table)
            .await
            .with_context(|| format!("could not drop table {tmp_table}"))?;
        let ddl = tgt
            .generate_ddl(&tmp_table, &df.columns)
            .with_context(|| format!("could not infer schema for {tmp_table}"))?;
        tgt.exec(&ddl)
            .await
            .with_context(|| format!("could not create temp table {tmp_table}"))?;
        let drop_conn = tgt.clone();
        let drop_table = tmp_table.clone();
        self.state
            .add_cleanup(Box::new(move || {
                Box::pin(async move {
                    if let Err(err) = drop_conn.drop_table(&drop_table).await {
                        warn!("temp table cleanup: {err:#}");
                    }
                })
            }))
            .await;

        // 4. Load the dataflow into the temp table transactionally.
        tgt.begin(None)
            .await
            .context("could not open transaction to write to temp table")?;
        self.state.set_progress("streaming data");
        let cnt = match tgt.bulk_import(&tmp_table, df).await {
            Ok(cnt) => cnt,
            Err(err) => {
                let _ = tgt.rollback().await;
                let hint = if self.flags.cli_hints
                    && (self.config.source.conn.is_file() || self.config.options.stdin)
                {
                    format!(
                        "could not insert into {target_table}. Maybe try a higher sample size (SAMPLE_SIZE=2000)?"
                    )
                } else {
                    format!("could not insert into {target_table}")
                };
                return Err(err.context(hint));
            }
        };
        tgt.commit()
            .await
            .context("could not commit temp table load")?;

        // 5. Row-count assertion: the data-loss surface.
        let table_count = tgt.get_count(&tmp_table).await.unwrap_or_default();
        if cnt != table_count {
            return Err(anyhow!(TaskError::TempCountMismatch {
                table_count,
                stream_count: cnt,
            }));
        }

        // 6. Checksum parity; sums get too large past 10k rows.
        let checksums = df.sync_stats();
        if cnt <= 10_000 {
            if let Err(err) = tgt
                .compare_checksums(&tmp_table, &df.columns, &checksums)
                .await
            {
                if self.flags.error_on_checksum_failure {
                    return Err(err);
                }
                debug!("{err:#}");
            }
        }

        // 7. The promote transaction. Serializable, except on dialects
        // that reject explicit isolation.
        let tx_options = tgt
            .dialect()
            .supports_isolation_level()
            .then(TxOptions::serializable);
        tgt.begin(tx_options)
            .await
            .context("could not open transaction to write to final table")?;

        // 8-10. Ensure target, promote per mode, post-SQL.
        if let Err(err) = self.promote_staged(df, tgt, &target_table, &tmp_table, cnt).await {
            let _ = tgt.rollback().await;
            return Err(err);
        }

        // 11. Commit.
        tgt.commit().await.context("could not commit")?;

        if let Some(err) = df.take_err() {
            return Err(err);
        }
        Ok(cnt)
    }

    /// Steps 8-10 of the protocol, inside the promote transaction.
    async fn promote_staged(
        &mut self,
        df: &Dataflow,
        tgt: &DbConn,
        target_table: &str,
        tmp_table: &str,
        cnt: u64,
    ) -> Result<()> {
        use sluice_core::config::Mode;

        if cnt > 0 {
            if self.config.mode() == Mode::FullRefresh {
                tgt.drop_table(target_table)
                    .await
                    .with_context(|| format!("could not drop table {target_table}"))?;
                self.state.set_progress(format!("dropped table {target_table}"));
            }

            let created = promote::create_table_if_not_exists(
                tgt,
                &df.columns,
                target_table,
                &self.config.target.options.table_ddl,
            )
            .await?;
            if created {
                self.state.set_progress(format!("created table {target_table}"));
            }

            if !created && self.flags.table_schema_optimization {
                tgt.optimize_table(target_table, &df.columns)
                    .await
                    .context("could not optimize table schema")?;
            }
            if !created
                && self.config.mode() != Mode::FullRefresh
                && self.config.target.options.add_new_columns
            {
                tgt.add_missing_columns(target_table, &df.columns)
                    .await
                    .context("could not add missing columns")?;
            }
        }

        // An update key without a primary key cannot upsert; degrade
        // to plain append.
        if !self.config.source.update_key.is_empty() && self.config.source.primary_key.is_empty()
        {
            self.config.set_mode(sluice_core::config::Mode::Append);
        }

        if cnt == 0 {
            self.state.set_progress("0 rows inserted. Nothing to do.");
        } else {
            promote::promote(
                &self.state,
                tgt,
                self.config.mode(),
                tmp_table,
                target_table,
                &self.config.source.primary_key,
            )
            .await?;
        }

        let post_sql = self.config.target.options.post_sql.clone();
        if !post_sql.is_empty() {
            self.state.set_progress("executing post-sql");
            let sql = if post_sql.to_lowercase().ends_with(".sql") {
                resolve_sql_text(&post_sql).context("could not get post-sql body")?
            } else {
                post_sql
            };
            tgt.exec(&sql).await.context("error executing post-sql")?;
        }
        Ok(())
    }
}

fn rand_digit() -> char {
    char::from(b'0' + rand::thread_rng().gen_range(0..10u8))
}

fn rand_lower_alnum() -> char {
    const POOL: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    POOL[rand::thread_rng().gen_range(0..POOL.len())] as char
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_suffix_chars_are_in_range() {
        for _ in 0..50 {
            assert!(rand_digit().is_ascii_digit());
            let c = rand_lower_alnum();
            assert!(c.is_ascii_lowercase() || c.is_ascii_digit());
        }
    }
}
