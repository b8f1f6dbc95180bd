//! In-memory reference database driver.
//!
//! Implements the `DatabaseConnection` contract over process-local
//! tables with snapshot-based transactions, reachable at `mem://<name>`
//! URLs. Its SQL surface is deliberately narrow: exactly the statement
//! shapes the engine's generic dialect emits (create/drop/truncate,
//! insert-from-select, select-star probes, and the max-watermark
//! query). Anything else errors.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sluice_core::columns::{Column, ColumnType, Columns};
use sluice_core::dataflow::Dataflow;
use sluice_core::dataset::Dataset;
use sluice_core::drivers::{DatabaseConnection, TxOptions};
use sluice_core::error::TaskError;
use sluice_core::templates::Dialect;
use sluice_core::value::{Row, Value};
use tracing::debug;

const BUFFER_ROWS: usize = 900;

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Columns,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MemState {
    tables: BTreeMap<String, MemTable>,
    tx_backup: Option<BTreeMap<String, MemTable>>,
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Mutex<MemState>>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Mutex<MemState>>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct MemoryConnection {
    name: String,
    state: Arc<Mutex<MemState>>,
    props: Mutex<BTreeMap<String, String>>,
}

impl MemoryConnection {
    /// A connection onto the named shared database; every connection
    /// with the same name sees the same tables.
    pub fn shared(name: &str) -> Arc<MemoryConnection> {
        let state = registry()
            .lock()
            .expect("registry poisoned")
            .entry(name.to_string())
            .or_default()
            .clone();
        Arc::new(MemoryConnection {
            name: format!("mem://{name}"),
            state,
            props: Mutex::new(BTreeMap::new()),
        })
    }

    /// A private database, for tests.
    pub fn isolated(name: &str) -> Arc<MemoryConnection> {
        Arc::new(MemoryConnection {
            name: format!("mem://{name}"),
            state: Arc::new(Mutex::new(MemState::default())),
            props: Mutex::new(BTreeMap::new()),
        })
    }

    /// Seed a table directly, bypassing SQL.
    pub fn seed_table(&self, table: &str, columns: Columns, rows: Vec<Row>) {
        let mut state = self.lock_state();
        state
            .tables
            .insert(norm_table(table), MemTable { columns, rows });
    }

    pub fn table_rows(&self, table: &str) -> Option<Vec<Row>> {
        self.lock_state()
            .tables
            .get(&norm_table(table))
            .map(|t| t.rows.clone())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().expect("mem state poisoned")
    }

    fn check_fail_prop(&self, sql: &str) -> Result<()> {
        let props = self.props.lock().expect("props poisoned");
        if let Some(needle) = props.get("fail_sql_contains") {
            if !needle.is_empty() && sql.contains(needle.as_str()) {
                bail!("simulated failure on statement: {sql}");
            }
        }
        Ok(())
    }

    fn run_query(&self, sql: &str) -> Result<Dataset> {
        let norm = normalize(sql);
        let lower = norm.to_lowercase();

        if let Some(rest) = strip_prefix_ci(&norm, "select max(") {
            let (col_raw, rest) = rest
                .split_once(')')
                .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
            let table_part = rest
                .to_lowercase()
                .find(" from ")
                .map(|i| rest[i + 6..].to_string())
                .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
            let table = norm_table(table_part.split_whitespace().next().unwrap_or(""));
            let col_name = unquote(col_raw.trim());
            let state = self.lock_state();
            let mem = state
                .tables
                .get(&table)
                .ok_or_else(|| anyhow!("relation {table} does not exist"))?;
            let col_idx = column_index(&mem.columns, &col_name)
                .ok_or_else(|| anyhow!("column {col_name} does not exist on {table}"))?;
            let typ = mem.columns[col_idx].typ;
            let mut ds = Dataset::new(Columns::new(vec![Column::new("max_val", typ)]));
            let max = mem
                .rows
                .iter()
                .filter_map(|r| {
                    let v = &r[col_idx];
                    (!v.is_null()).then_some(v)
                })
                .max_by(|a, b| value_cmp(a, b).unwrap_or(Ordering::Equal));
            if let Some(max) = max {
                ds.rows.push(vec![max.clone()]);
            }
            return Ok(ds);
        }

        if lower.starts_with("select ") {
            return self.run_select(&norm);
        }
        Err(anyhow!("unsupported sql: {norm}"))
    }

    fn run_select(&self, norm: &str) -> Result<Dataset> {
        let lower = norm.to_lowercase();
        let from_pos = lower
            .find(" from ")
            .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
        let fields_raw = norm["select ".len()..from_pos].trim().to_string();
        let mut tail = norm[from_pos + 6..].split_whitespace();
        let table = norm_table(tail.next().unwrap_or(""));
        let rest: Vec<&str> = tail.collect();

        let state = self.lock_state();
        let mem = state
            .tables
            .get(&table)
            .ok_or_else(|| anyhow!("relation {table} does not exist"))?;

        let indices: Vec<usize> = if fields_raw == "*" {
            (0..mem.columns.len()).collect()
        } else {
            split_top_level(&fields_raw)
                .iter()
                .map(|f| {
                    let name = unquote(f.trim());
                    column_index(&mem.columns, &name)
                        .ok_or_else(|| anyhow!("column {name} does not exist on {table}"))
                })
                .collect::<Result<_>>()?
        };
        let columns =
            Columns::new(indices.iter().map(|&i| mem.columns[i].clone()).collect());

        let (filter, limit) = parse_select_tail(&rest, &mem.columns)?;
        let mut rows = Vec::new();
        for row in &mem.rows {
            let keep = match &filter {
                RowFilter::All => true,
                RowFilter::Never => false,
                RowFilter::Compare(col_idx, op, lit) => {
                    match value_cmp(&row[*col_idx], lit) {
                        Some(Ordering::Greater) => true,
                        Some(Ordering::Equal) => op == ">=",
                        _ => false,
                    }
                }
            };
            if !keep {
                continue;
            }
            rows.push(indices.iter().map(|&i| row[i].clone()).collect());
            if let Some(limit) = limit {
                if rows.len() >= limit {
                    break;
                }
            }
        }
        let mut ds = Dataset::new(columns);
        ds.rows = rows;
        Ok(ds)
    }

    fn run_exec(&self, sql: &str) -> Result<u64> {
        let norm = normalize(sql);
        let lower = norm.to_lowercase();

        if let Some(rest) = strip_prefix_ci(&norm, "create table ") {
            let (table_raw, defs) = rest
                .split_once('(')
                .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
            let table = norm_table(table_raw.trim());
            let defs = defs
                .rsplit_once(')')
                .map(|(d, _)| d)
                .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
            let mut columns = Columns::default();
            for def in split_top_level(defs) {
                let def = def.trim();
                let (name, typ) = def
                    .split_once(' ')
                    .ok_or_else(|| anyhow!("bad column definition: {def}"))?;
                columns.push(Column::new(unquote(name), ColumnType::from_ddl_type(typ)));
            }
            let mut state = self.lock_state();
            if state.tables.contains_key(&table) {
                bail!("table {table} already exists");
            }
            state.tables.insert(table, MemTable { columns, rows: Vec::new() });
            return Ok(0);
        }

        if let Some(rest) = strip_prefix_ci(&norm, "drop table ") {
            let table = norm_table(rest.trim());
            let mut state = self.lock_state();
            state
                .tables
                .remove(&table)
                .ok_or_else(|| anyhow!("table {table} does not exist"))?;
            return Ok(0);
        }

        if let Some(rest) = strip_prefix_ci(&norm, "truncate table ")
            .or_else(|| strip_prefix_ci(&norm, "delete from "))
        {
            let table = norm_table(rest.trim());
            let mut state = self.lock_state();
            let mem = state
                .tables
                .get_mut(&table)
                .ok_or_else(|| anyhow!("table {table} does not exist"))?;
            let affected = mem.rows.len() as u64;
            mem.rows.clear();
            return Ok(affected);
        }

        if lower.starts_with("insert into ") {
            return self.run_insert_select(&norm);
        }
        Err(anyhow!("unsupported sql: {norm}"))
    }

    /// `insert into <tgt> (<fields>) select <fields> from <src>`
    fn run_insert_select(&self, norm: &str) -> Result<u64> {
        let rest = strip_prefix_ci(norm, "insert into ").unwrap_or(norm);
        let (tgt_raw, rest) = rest
            .split_once('(')
            .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
        let tgt = norm_table(tgt_raw.trim());
        let close = matching_paren(rest)
            .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
        let tgt_fields: Vec<String> = split_top_level(&rest[..close])
            .iter()
            .map(|f| unquote(f.trim()))
            .collect();
        let after = rest[close + 1..].trim();
        let select = strip_prefix_ci(after, "select ")
            .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
        let from_pos = top_level_from(select)
            .ok_or_else(|| anyhow!("unsupported sql: {norm}"))?;
        let src_fields: Vec<String> = split_top_level(select[..from_pos].trim())
            .iter()
            .map(|f| cast_inner_field(f.trim()))
            .collect();
        let src = norm_table(
            select[from_pos + 6..]
                .split_whitespace()
                .next()
                .unwrap_or(""),
        );
        if tgt_fields.len() != src_fields.len() {
            bail!("insert column lists differ in length");
        }

        let mut state = self.lock_state();
        let src_table = state
            .tables
            .get(&src)
            .ok_or_else(|| anyhow!("table {src} does not exist"))?
            .clone();
        let src_indices: Vec<usize> = src_fields
            .iter()
            .map(|f| {
                column_index(&src_table.columns, f)
                    .ok_or_else(|| anyhow!("column {f} does not exist on {src}"))
            })
            .collect::<Result<_>>()?;
        let tgt_table = state
            .tables
            .get_mut(&tgt)
            .ok_or_else(|| anyhow!("table {tgt} does not exist"))?;

        let mut inserted = 0u64;
        for row in &src_table.rows {
            let mut out = vec![Value::Null; tgt_table.columns.len()];
            for (field, &src_idx) in tgt_fields.iter().zip(&src_indices) {
                let tgt_idx = column_index(&tgt_table.columns, field)
                    .ok_or_else(|| anyhow!("column {field} does not exist on {tgt}"))?;
                out[tgt_idx] = row[src_idx].clone();
            }
            tgt_table.rows.push(out);
            inserted += 1;
        }
        Ok(inserted)
    }
}

#[async_trait]
impl DatabaseConnection for MemoryConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Generic
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}

    fn set_prop(&self, key: &str, value: &str) {
        self.props
            .lock()
            .expect("props poisoned")
            .insert(key.to_string(), value.to_string());
    }

    async fn exec(&self, sql: &str) -> Result<u64> {
        self.check_fail_prop(sql)?;
        self.run_exec(sql)
    }

    async fn query(&self, sql: &str) -> Result<Dataset> {
        self.check_fail_prop(sql)?;
        self.run_query(sql)
    }

    async fn bulk_export(&self, sql: &str) -> Result<Dataflow> {
        let ds = self.run_query(sql).with_context(|| format!("export query: {sql}"))?;
        Ok(Dataflow::from_dataset(ds, BUFFER_ROWS))
    }

    async fn bulk_import(&self, table: &str, df: &mut Dataflow) -> Result<u64> {
        self.check_fail_prop("bulk_import")?;
        // Simulated backend latency, cancellable through the flow.
        let delay = {
            let props = self.props.lock().expect("props poisoned");
            props.get("import_delay_ms").and_then(|v| v.parse::<u64>().ok())
        };
        if let Some(ms) = delay {
            let cancel_token = df.cancel_token();
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {}
                _ = cancel_token.cancelled() => bail!("import cancelled"),
            }
        }
        let table = norm_table(table);
        let arity = {
            let state = self.lock_state();
            state
                .tables
                .get(&table)
                .ok_or_else(|| anyhow!("table {table} does not exist"))?
                .columns
                .len()
        };
        let mut count = 0u64;
        for mut stream in df.take_streams() {
            while let Some(batch) = stream.next_batch().await {
                let mut state = self.lock_state();
                let mem = state
                    .tables
                    .get_mut(&table)
                    .ok_or_else(|| anyhow!("table {table} does not exist"))?;
                for row in batch {
                    if row.len() != arity {
                        bail!(
                            "row arity {} does not match table {table} ({arity} columns)",
                            row.len()
                        );
                    }
                    mem.rows.push(row);
                    count += 1;
                }
            }
        }
        if let Some(err) = df.take_err() {
            return Err(err.context("source stream failed during import"));
        }
        Ok(count)
    }

    async fn get_columns(&self, table: &str) -> Result<Columns> {
        let state = self.lock_state();
        let table = norm_table(table);
        state
            .tables
            .get(&table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| anyhow!("table {table} does not exist"))
    }

    async fn get_sql_columns(&self, sql: &str) -> Result<Columns> {
        Ok(self.run_query(sql)?.columns)
    }

    async fn get_count(&self, table: &str) -> Result<u64> {
        let state = self.lock_state();
        let table = norm_table(table);
        state
            .tables
            .get(&table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| anyhow!("table {table} does not exist"))
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        Ok(self.lock_state().tables.contains_key(&norm_table(table)))
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        let mut state = self.lock_state();
        if state.tables.remove(&norm_table(table)).is_none() {
            debug!("drop of missing table {table} ignored");
        }
        Ok(())
    }

    fn generate_ddl(&self, table: &str, columns: &Columns) -> Result<String> {
        if columns.is_empty() {
            bail!("cannot generate DDL for {table} with no columns");
        }
        let defs: Vec<String> = columns
            .iter()
            .map(|c| format!("\"{}\" {}", c.name, c.typ.ddl_type()))
            .collect();
        Ok(format!("create table {table} ({})", defs.join(", ")))
    }

    async fn upsert(
        &self,
        src_table: &str,
        tgt_table: &str,
        primary_key: &[String],
    ) -> Result<u64> {
        self.check_fail_prop("upsert")?;
        let mut state = self.lock_state();
        let src = state
            .tables
            .get(&norm_table(src_table))
            .ok_or_else(|| anyhow!("table {src_table} does not exist"))?
            .clone();
        let tgt = state
            .tables
            .get_mut(&norm_table(tgt_table))
            .ok_or_else(|| anyhow!("table {tgt_table} does not exist"))?;

        let src_pk: Vec<usize> = primary_key
            .iter()
            .map(|k| {
                column_index(&src.columns, k)
                    .ok_or_else(|| anyhow!("primary key {k} missing on {src_table}"))
            })
            .collect::<Result<_>>()?;
        let tgt_pk: Vec<usize> = primary_key
            .iter()
            .map(|k| {
                column_index(&tgt.columns, k)
                    .ok_or_else(|| anyhow!("primary key {k} missing on {tgt_table}"))
            })
            .collect::<Result<_>>()?;

        let incoming: HashSet<String> =
            src.rows.iter().map(|r| key_of(r, &src_pk)).collect();
        let before = tgt.rows.len();
        tgt.rows.retain(|r| !incoming.contains(&key_of(r, &tgt_pk)));
        let deleted = (before - tgt.rows.len()) as u64;

        let mapping: Vec<Option<usize>> = tgt
            .columns
            .iter()
            .map(|c| column_index(&src.columns, &c.name))
            .collect();
        for row in &src.rows {
            tgt.rows.push(
                mapping
                    .iter()
                    .map(|m| m.map(|i| row[i].clone()).unwrap_or(Value::Null))
                    .collect(),
            );
        }
        Ok(deleted + src.rows.len() as u64)
    }

    async fn swap_table(&self, src_table: &str, tgt_table: &str) -> Result<()> {
        let mut state = self.lock_state();
        let src_key = norm_table(src_table);
        let tgt_key = norm_table(tgt_table);
        let src = state
            .tables
            .remove(&src_key)
            .ok_or_else(|| anyhow!("table {src_table} does not exist"))?;
        match state.tables.remove(&tgt_key) {
            Some(tgt) => {
                state.tables.insert(tgt_key, src);
                state.tables.insert(src_key, tgt);
            }
            None => {
                state.tables.insert(tgt_key, src);
            }
        }
        Ok(())
    }

    async fn optimize_table(&self, table: &str, columns: &Columns) -> Result<()> {
        let mut state = self.lock_state();
        let table = norm_table(table);
        let mem = state
            .tables
            .get_mut(&table)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;
        for incoming in columns.iter() {
            if let Some(idx) = column_index(&mem.columns, &incoming.name) {
                let widened = mem.columns[idx].typ.merge(incoming.typ);
                mem.columns[idx].typ = widened;
            }
        }
        Ok(())
    }

    async fn add_missing_columns(&self, table: &str, columns: &Columns) -> Result<()> {
        let mut state = self.lock_state();
        let table = norm_table(table);
        let mem = state
            .tables
            .get_mut(&table)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;
        for incoming in columns.iter() {
            if column_index(&mem.columns, &incoming.name).is_none() {
                mem.columns.push(incoming.clone());
                for row in &mut mem.rows {
                    row.push(Value::Null);
                }
            }
        }
        Ok(())
    }

    async fn compare_checksums(
        &self,
        table: &str,
        columns: &Columns,
        checksums: &[u64],
    ) -> Result<()> {
        let state = self.lock_state();
        let table_key = norm_table(table);
        let mem = state
            .tables
            .get(&table_key)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;
        for (col, &expected) in columns.iter().zip(checksums) {
            let Some(idx) = column_index(&mem.columns, &col.name) else {
                continue;
            };
            let actual = mem
                .rows
                .iter()
                .fold(0u64, |acc, r| acc.wrapping_add(r[idx].checksum_component()));
            if actual != expected {
                return Err(anyhow::Error::new(TaskError::ChecksumMismatch {
                    column: col.name.clone(),
                    stream: expected,
                    table: actual,
                }));
            }
        }
        Ok(())
    }

    async fn begin(&self, _options: Option<TxOptions>) -> Result<()> {
        let mut state = self.lock_state();
        if state.tx_backup.is_some() {
            bail!("transaction already open on {}", self.name);
        }
        state.tx_backup = Some(state.tables.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.lock_state().tx_backup = None;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.lock_state();
        if let Some(backup) = state.tx_backup.take() {
            // Restore the snapshot, except tables another session has
            // dropped in the meantime (cleanup) stay dropped.
            let existing: HashSet<String> = state.tables.keys().cloned().collect();
            state.tables = backup
                .into_iter()
                .filter(|(name, _)| existing.contains(name))
                .collect();
        }
        Ok(())
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn unquote(s: &str) -> String {
    s.trim_matches(|c| c == '"' || c == '`' || c == '[' || c == ']')
        .to_string()
}

fn norm_table(s: &str) -> String {
    s.split('.')
        .map(|p| unquote(p).to_lowercase())
        .collect::<Vec<_>>()
        .join(".")
}

fn column_index(columns: &Columns, name: &str) -> Option<usize> {
    columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(name))
}

fn key_of(row: &Row, indices: &[usize]) -> String {
    indices
        .iter()
        .map(|&i| row[i].to_csv_field())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Split on commas outside parentheses.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Index of the closing paren matching an implicit opener before `s`.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                if depth == 0 {
                    return Some(i);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Position of ` from ` at paren depth zero.
fn top_level_from(s: &str) -> Option<usize> {
    let lower = s.to_lowercase();
    let bytes = lower.as_bytes();
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ => {
                if depth == 0 && bytes[i..].starts_with(b" from ") {
                    return Some(i);
                }
            }
        }
    }
    None
}

/// `cast("x" as type)` selects `x`; a bare field selects itself.
fn cast_inner_field(expr: &str) -> String {
    let lower = expr.to_lowercase();
    if let Some(inner) = lower.strip_prefix("cast(") {
        if let Some(as_pos) = inner.find(" as ") {
            return unquote(expr["cast(".len().."cast(".len() + as_pos].trim());
        }
    }
    unquote(expr)
}

enum RowFilter {
    All,
    Never,
    Compare(usize, String, Value),
}

/// Parse the optional `where <col> >=|> <lit>` / `where 1=0|1=1` and
/// trailing `limit N` of a select.
fn parse_select_tail(tokens: &[&str], columns: &Columns) -> Result<(RowFilter, Option<usize>)> {
    let limit_pos = tokens.iter().position(|t| t.eq_ignore_ascii_case("limit"));
    let limit = limit_pos
        .and_then(|p| tokens.get(p + 1))
        .and_then(|t| t.parse::<usize>().ok());

    let where_pos = tokens.iter().position(|t| t.eq_ignore_ascii_case("where"));
    let filter = match where_pos {
        None => RowFilter::All,
        Some(pos) => {
            let end = limit_pos.unwrap_or(tokens.len());
            let clause = tokens[pos + 1..end].join(" ");
            let compact: String = clause.chars().filter(|c| !c.is_whitespace()).collect();
            match compact.as_str() {
                "1=0" => RowFilter::Never,
                "1=1" => RowFilter::All,
                _ => {
                    let (col_raw, op, lit_raw) = parse_comparison(&clause)?;
                    let name = unquote(&col_raw);
                    let idx = column_index(columns, &name)
                        .ok_or_else(|| anyhow!("column {name} does not exist"))?;
                    let lit = parse_literal(&lit_raw, columns[idx].typ);
                    RowFilter::Compare(idx, op, lit)
                }
            }
        }
    };
    Ok((filter, limit))
}

fn parse_comparison(clause: &str) -> Result<(String, String, String)> {
    for op in [">=", ">"] {
        if let Some((col, lit)) = clause.split_once(op) {
            return Ok((col.trim().to_string(), op.to_string(), lit.trim().to_string()));
        }
    }
    Err(anyhow!("unsupported where clause: {clause}"))
}

fn parse_literal(raw: &str, typ: ColumnType) -> Value {
    let raw = raw.trim();
    if raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2 {
        let inner = raw[1..raw.len() - 1].replace("''", "'");
        return Value::parse_as(typ, &inner);
    }
    Value::parse_as(typ, raw)
}

fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    use Value::*;
    match (a, b) {
        (Null, Null) => Some(Ordering::Equal),
        (Null, _) => Some(Ordering::Less),
        (_, Null) => Some(Ordering::Greater),
        (Bool(x), Bool(y)) => Some(x.cmp(y)),
        (Int(x), Int(y)) => Some(x.cmp(y)),
        (Float(x), Float(y)) => x.partial_cmp(y),
        (Int(x), Float(y)) => (*x as f64).partial_cmp(y),
        (Float(x), Int(y)) => x.partial_cmp(&(*y as f64)),
        (Date(x), Date(y)) => Some(x.cmp(y)),
        (Timestamp(x), Timestamp(y)) => Some(x.cmp(y)),
        (Text(x), Text(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> Arc<MemoryConnection> {
        let conn = MemoryConnection::isolated("t");
        conn.seed_table(
            "public.t1",
            Columns::new(vec![
                Column::new("id", ColumnType::BigInt),
                Column::new("name", ColumnType::Text),
            ]),
            vec![
                vec![Value::Int(1), Value::Text("a".into())],
                vec![Value::Int(2), Value::Text("b".into())],
            ],
        );
        conn
    }

    #[tokio::test]
    async fn select_star_and_probe() {
        let conn = seeded();
        let ds = conn.query("select * from public.t1").await.unwrap();
        assert_eq!(ds.len(), 2);
        let probe = conn
            .query("select * from public.t1 where 1=0")
            .await
            .unwrap();
        assert_eq!(probe.len(), 0);
        assert_eq!(probe.columns.names(), vec!["id", "name"]);
    }

    #[tokio::test]
    async fn max_query_formats() {
        let conn = seeded();
        let ds = conn
            .query("select max(\"id\") as max_val from public.t1")
            .await
            .unwrap();
        assert_eq!(ds.rows[0][0], Value::Int(2));

        let err = conn
            .query("select max(\"id\") as max_val from public.missing")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exist"));
    }

    #[tokio::test]
    async fn where_comparison_filters() {
        let conn = seeded();
        let ds = conn
            .query("select * from public.t1 where \"id\" > 1")
            .await
            .unwrap();
        assert_eq!(ds.len(), 1);
        let ds = conn
            .query("select * from public.t1 where \"id\" >= 1")
            .await
            .unwrap();
        assert_eq!(ds.len(), 2);
    }

    #[tokio::test]
    async fn insert_from_select_maps_by_name() {
        let conn = seeded();
        conn.exec("create table public.t2 (\"name\" text, \"id\" bigint)")
            .await
            .unwrap();
        let n = conn
            .exec(
                "insert into public.t2 (\"id\", \"name\") select \"id\", \"name\" from public.t1",
            )
            .await
            .unwrap();
        assert_eq!(n, 2);
        let rows = conn.table_rows("public.t2").unwrap();
        // t2 stores name first; mapping is by name, not position.
        assert_eq!(rows[0][0], Value::Text("a".into()));
        assert_eq!(rows[0][1], Value::Int(1));
    }

    #[tokio::test]
    async fn rollback_restores_snapshot() {
        let conn = seeded();
        conn.begin(None).await.unwrap();
        conn.exec("truncate table public.t1").await.unwrap();
        assert_eq!(conn.get_count("public.t1").await.unwrap(), 0);
        conn.rollback().await.unwrap();
        assert_eq!(conn.get_count("public.t1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn upsert_deletes_then_inserts() {
        let conn = seeded();
        conn.seed_table(
            "public.t1_tmp",
            Columns::new(vec![
                Column::new("id", ColumnType::BigInt),
                Column::new("name", ColumnType::Text),
            ]),
            vec![
                vec![Value::Int(2), Value::Text("b2".into())],
                vec![Value::Int(3), Value::Text("c".into())],
            ],
        );
        let affected = conn
            .upsert("public.t1_tmp", "public.t1", &["id".to_string()])
            .await
            .unwrap();
        assert_eq!(affected, 3);
        let mut rows = conn.table_rows("public.t1").unwrap();
        rows.sort_by(|a, b| value_cmp(&a[0], &b[0]).unwrap());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][1], Value::Text("b2".into()));
    }

    #[tokio::test]
    async fn swap_table_exchanges_contents() {
        let conn = seeded();
        conn.seed_table(
            "public.t1_new",
            Columns::new(vec![Column::new("id", ColumnType::BigInt)]),
            vec![vec![Value::Int(9)]],
        );
        conn.swap_table("public.t1_new", "public.t1").await.unwrap();
        assert_eq!(conn.table_rows("public.t1").unwrap(), vec![vec![Value::Int(9)]]);
        assert_eq!(conn.table_rows("public.t1_new").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_typed() {
        let conn = seeded();
        let cols = conn.get_columns("public.t1").await.unwrap();
        let err = conn
            .compare_checksums("public.t1", &cols, &[999, 999])
            .await
            .unwrap_err();
        assert!(sluice_core::error::has_kind(&err, |e| matches!(
            e,
            TaskError::ChecksumMismatch { .. }
        )));
        let ok = conn.compare_checksums("public.t1", &cols, &[3, 2]).await;
        assert!(ok.is_ok());
    }
}
