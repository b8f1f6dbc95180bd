//! Load-mode promoter: move staged rows into the final target.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use sluice_core::columns::Columns;
use sluice_core::config::Mode;
use sluice_core::drivers::DbConn;
use sluice_core::templates::render;
use tracing::debug;

use crate::task::TaskState;

/// Create `table` when absent, from explicit DDL or the flow schema.
/// Returns whether it was created.
pub(crate) async fn create_table_if_not_exists(
    conn: &DbConn,
    columns: &Columns,
    table: &str,
    table_ddl: &str,
) -> Result<bool> {
    let exists = conn
        .table_exists(table)
        .await
        .with_context(|| format!("error checking table {table}"))?;
    if exists {
        return Ok(false);
    }

    let ddl = if table_ddl.is_empty() {
        conn.generate_ddl(table, columns)
            .with_context(|| format!("could not generate DDL for {table}"))?
    } else {
        table_ddl.to_string()
    };

    if let Err(err) = conn.exec(&ddl).await {
        let filter = conn.template().error_filter_table_exists;
        if !filter.is_empty() && format!("{err:#}").contains(filter) {
            return Err(err.context(format!("error creating table {table} as it already exists")));
        }
        return Err(err.context(format!("error creating table {table}")));
    }
    Ok(true)
}

/// Enact the load mode now that the temp table holds exactly the
/// streamed rows.
pub(crate) async fn promote(
    state: &Arc<TaskState>,
    conn: &DbConn,
    mode: Mode,
    tmp_table: &str,
    target_table: &str,
    primary_key: &[String],
) -> Result<()> {
    match mode {
        Mode::Append | Mode::Snapshot | Mode::FullRefresh => {
            insert_from_temp(conn, tmp_table, target_table)
                .await
                .context("could not insert from temp")?;
        }
        Mode::Truncate => {
            let truncate_sql =
                render(conn.template().truncate_table, &[("table", target_table)]);
            conn.exec(&truncate_sql)
                .await
                .with_context(|| format!("could not truncate table: {target_table}"))?;
            state.set_progress(format!("truncated table {target_table}"));
            insert_from_temp(conn, tmp_table, target_table)
                .await
                .context("could not insert from temp")?;
        }
        Mode::Incremental => {
            let affected = conn
                .upsert(tmp_table, target_table, primary_key)
                .await
                .context("could not upsert from temp")?;
            debug!("{affected} total inserts / updates");
        }
        Mode::Sql => bail!("mode sql does not promote"),
    }
    Ok(())
}

/// Insert temp rows into the target over the intersection of their
/// column sets, with per-column casts to the target types.
pub(crate) async fn insert_from_temp(
    conn: &DbConn,
    tmp_table: &str,
    target_table: &str,
) -> Result<()> {
    let mut tmp_columns = conn
        .get_columns(tmp_table)
        .await
        .with_context(|| format!("could not get column list for {tmp_table}"))?;
    let tgt_columns = conn
        .get_columns(target_table)
        .await
        .with_context(|| format!("could not get column list for {target_table}"))?;

    // Drivers that cannot see real headers report placeholder names;
    // match them to the target positionally.
    if tmp_columns.is_dummy() && tmp_columns.len() == tgt_columns.len() {
        for (tmp_col, tgt_col) in tmp_columns.iter_mut().zip(tgt_columns.iter()) {
            tmp_col.name = tgt_col.name.clone();
        }
    }

    let mut tgt_fields = Vec::new();
    let mut src_fields = Vec::new();
    for tgt_col in tgt_columns.iter() {
        if let Some(tmp_col) = tmp_columns.get(&tgt_col.name) {
            tgt_fields.push(conn.quote(&tgt_col.name));
            src_fields.push(render(
                conn.template().cast_select_field,
                &[
                    ("field", conn.quote(&tmp_col.name).as_str()),
                    ("type", tgt_col.typ.ddl_type()),
                ],
            ));
        }
    }
    if tgt_fields.is_empty() {
        bail!("columns mismatched between {tmp_table} and {target_table}");
    }

    let sql = render(
        conn.template().insert_from_table,
        &[
            ("tgt_table", target_table),
            ("src_table", tmp_table),
            ("tgt_fields", tgt_fields.join(", ").as_str()),
            ("src_fields", src_fields.join(", ").as_str()),
        ],
    );
    conn.exec(&sql)
        .await
        .with_context(|| format!("could not execute SQL: {sql}"))?;
    debug!("inserted rows into `{target_table}` from temp table `{tmp_table}`");
    Ok(())
}
