use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sluice_core::columns::{infer_from_records, Column, ColumnType, Columns};
use sluice_core::dataflow::{Dataflow, StreamWriter, CHANNEL_CAPACITY};
use sluice_core::dataset::parse_record;
use sluice_core::drivers::{FileStreamConfig, FileSystemClient};
use sluice_core::env;
use sluice_core::error::TaskError;
use sluice_core::value::{Row, Value};
use tracing::{debug, warn};

use crate::stdio::CountingWriter;

/// Metadata columns appended to every produced row when enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetadata {
    /// Load epoch stamped into `_sling_loaded_at`.
    pub loaded_at: Option<i64>,
    /// Stamp the originating file URL into `_sling_stream_url`.
    pub stream_url: bool,
}

impl FlowMetadata {
    fn width(&self) -> usize {
        self.loaded_at.is_some() as usize + self.stream_url as usize
    }

    fn extend_columns(&self, columns: &mut Columns) {
        if self.loaded_at.is_some() {
            columns.push(Column::new(env::LOADED_AT_COLUMN, ColumnType::BigInt));
        }
        if self.stream_url {
            columns.push(Column::new(env::STREAM_URL_COLUMN, ColumnType::Text));
        }
    }

    fn extend_row(&self, row: &mut Row, file_url: &str) {
        if let Some(epoch) = self.loaded_at {
            row.push(Value::Int(epoch));
        }
        if self.stream_url {
            row.push(Value::Text(file_url.to_string()));
        }
    }
}

/// CSV over the local filesystem: plain files, directories, and glob
/// patterns under `file://` URLs or bare paths.
#[derive(Debug, Clone, Default)]
pub struct LocalFsClient {
    /// Only read files modified after this epoch second.
    fs_timestamp: Option<i64>,
    metadata: FlowMetadata,
    /// Rows per output file; 0 is unlimited.
    file_row_limit: u64,
    sample_size: usize,
    parallel: bool,
}

impl LocalFsClient {
    pub fn new() -> LocalFsClient {
        LocalFsClient { sample_size: 900, parallel: true, ..Default::default() }
    }

    /// Build from merged connection/option properties, the way the
    /// engine hands them to any filesystem driver.
    pub fn from_props(props: &BTreeMap<String, String>) -> LocalFsClient {
        let mut client = LocalFsClient::new();
        if let Some(ts) = props.get(env::FS_TIMESTAMP_PROP).and_then(|v| v.parse().ok()) {
            client.fs_timestamp = Some(ts);
        }
        if let Some(epoch) = props.get("SLING_LOADED_AT").and_then(|v| v.parse().ok()) {
            client.metadata.loaded_at = Some(epoch);
        }
        if props.get("SLING_STREAM_URL").map(|v| v == "true").unwrap_or(false) {
            client.metadata.stream_url = true;
        }
        if let Some(limit) = props.get("SLING_FILE_ROW_LIMIT").and_then(|v| v.parse().ok()) {
            client.file_row_limit = limit;
        }
        if let Some(size) = props.get("SAMPLE_SIZE").and_then(|v| v.parse().ok()) {
            client.sample_size = size;
        }
        if let Some(parallel) = props.get("SLING_PARALLEL") {
            client.parallel = parallel.to_ascii_lowercase() != "false";
        }
        client
    }

    fn list_files(&self, path: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let p = Path::new(path);
        if path.contains('*') || path.contains('?') || path.contains('[') {
            for entry in glob::glob(path).context("bad glob pattern")? {
                let pb = entry?;
                if pb.is_file() {
                    files.push(pb);
                }
            }
            files.sort();
        } else if p.is_dir() {
            for entry in std::fs::read_dir(p).with_context(|| format!("read dir {path}"))? {
                let pb = entry?.path();
                if pb.is_file() {
                    files.push(pb);
                }
            }
            files.sort();
        } else if p.is_file() {
            files.push(p.to_path_buf());
        }
        Ok(files)
    }

    /// Schema and buffered head of the first file, with the column
    /// projection and metadata columns applied.
    fn sample_file(
        &self,
        file: &Path,
        cfg: &FileStreamConfig,
    ) -> Result<(Columns, Vec<usize>, Vec<Row>)> {
        let mut reader = csv_reader(file)?;
        let headers: Vec<String> =
            reader.headers()?.iter().map(|h| h.to_string()).collect();
        let projection = resolve_projection(&headers, &cfg.columns)?;
        let names: Vec<String> =
            projection.iter().map(|&i| headers[i].clone()).collect();

        let mut records: Vec<Vec<String>> = Vec::new();
        for record in reader.records().take(self.sample_size) {
            let record = record?;
            records.push(project(&record, &projection));
        }
        let mut columns = infer_from_records(&names, &records, true);
        let data_columns = columns.clone();
        self.metadata.extend_columns(&mut columns);

        let url = file_url(file);
        let rows = records
            .iter()
            .map(|record| {
                let mut row = parse_record(&data_columns, record);
                self.metadata.extend_row(&mut row, &url);
                row
            })
            .collect();
        Ok((columns, projection, rows))
    }
}

#[async_trait]
impl FileSystemClient for LocalFsClient {
    async fn read_dataflow(&self, url: &str, cfg: FileStreamConfig) -> Result<Dataflow> {
        let path = local_path(url);
        let mut files = self.list_files(&path)?;
        if let Some(watermark) = self.fs_timestamp {
            files.retain(|f| modified_epoch(f).map(|m| m > watermark).unwrap_or(true));
        }
        if files.is_empty() {
            return Err(anyhow::Error::new(TaskError::NoFilesFound { url: url.to_string() }));
        }
        debug!("reading {} file(s) from {url}", files.len());

        let (columns, projection, sample) = self.sample_file(&files[0], &cfg)?;
        let mut df = Dataflow::new(columns.clone());
        df.buffer = sample;
        df.fs_url = Some(url.to_string());

        let remaining = Arc::new(AtomicU64::new(if cfg.limit > 0 { cfg.limit } else { u64::MAX }));
        let metadata = self.metadata;
        if self.parallel && files.len() > 1 {
            for file in files {
                let writer = df.add_stream(CHANNEL_CAPACITY);
                let task = FileReadTask {
                    columns: columns.clone(),
                    projection: projection.clone(),
                    metadata,
                    remaining: remaining.clone(),
                };
                tokio::spawn(async move { task.run(vec![file], writer).await });
            }
        } else {
            let writer = df.add_stream(CHANNEL_CAPACITY);
            let task = FileReadTask {
                columns: columns.clone(),
                projection: projection.clone(),
                metadata,
                remaining,
            };
            tokio::spawn(async move { task.run(files, writer).await });
        }
        Ok(df)
    }

    async fn write_dataflow(&self, df: &mut Dataflow, url: &str) -> Result<u64> {
        let path = local_path(url);
        let streams = df.take_streams();
        let columns = df.columns.clone();
        let dir_mode =
            streams.len() > 1 || path.ends_with('/') || self.file_row_limit > 0;

        let mut handles = Vec::new();
        for (idx, stream) in streams.into_iter().enumerate() {
            let task = FileWriteTask {
                columns: columns.clone(),
                path: path.clone(),
                dir_mode,
                stream_index: idx,
                row_limit: self.file_row_limit,
            };
            handles.push(tokio::spawn(async move { task.run(stream).await }));
        }
        let mut bytes = 0u64;
        for handle in handles {
            bytes += handle.await.context("file write worker panicked")??;
        }
        df.add_out_bytes(bytes);
        Ok(bytes)
    }
}

struct FileReadTask {
    columns: Columns,
    projection: Vec<usize>,
    metadata: FlowMetadata,
    remaining: Arc<AtomicU64>,
}

impl FileReadTask {
    async fn run(self, files: Vec<PathBuf>, mut writer: StreamWriter) {
        for file in &files {
            if writer.is_cancelled() {
                break;
            }
            if let Err(err) = self.read_file(file, &mut writer).await {
                writer.fail(err.context(format!("reading {}", file.display())));
                return;
            }
        }
        if let Err(err) = writer.close().await {
            debug!("file read flow close: {err:#}");
        }
    }

    async fn read_file(&self, file: &Path, writer: &mut StreamWriter) -> Result<()> {
        let mut reader = csv_reader(file)?;
        let url = file_url(file);
        let data_arity = self.columns.len() - self.metadata.width();
        // Schema is fixed; the header row only sets the file's width.
        let file_width = reader.headers()?.len();
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(err) => {
                    warn!("csv read error in {}: {err}", file.display());
                    continue;
                }
            };
            if record.len() != file_width {
                return Err(anyhow!(
                    "row has {} fields, expected {}",
                    record.len(),
                    file_width
                ));
            }
            if !take_one(&self.remaining) {
                return Ok(());
            }
            let fields = project(&record, &self.projection);
            let mut row = parse_record_prefix(&self.columns, data_arity, &fields);
            self.metadata.extend_row(&mut row, &url);
            match writer.push(row).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

struct FileWriteTask {
    columns: Columns,
    path: String,
    dir_mode: bool,
    stream_index: usize,
    row_limit: u64,
}

impl FileWriteTask {
    fn open_part(&self, part: usize) -> Result<csv::Writer<CountingWriter<std::fs::File>>> {
        let path = if self.dir_mode {
            std::fs::create_dir_all(&self.path)
                .with_context(|| format!("create dir {}", self.path))?;
            Path::new(&self.path)
                .join(format!("part.{:02}.{:04}.csv", self.stream_index, part))
        } else {
            if let Some(parent) = Path::new(&self.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            PathBuf::from(&self.path)
        };
        let file = std::fs::File::create(&path)
            .with_context(|| format!("create {}", path.display()))?;
        let mut writer = csv::Writer::from_writer(CountingWriter::new(file));
        writer.write_record(self.columns.names())?;
        Ok(writer)
    }

    async fn run(self, mut stream: sluice_core::dataflow::Datastream) -> Result<u64> {
        let mut part = 0;
        let mut rows_in_part = 0u64;
        let mut bytes = 0u64;
        let mut writer = self.open_part(part)?;
        while let Some(batch) = stream.next_batch().await {
            for row in batch {
                if self.row_limit > 0 && rows_in_part >= self.row_limit {
                    writer.flush()?;
                    bytes += writer.get_ref().bytes();
                    part += 1;
                    rows_in_part = 0;
                    writer = self.open_part(part)?;
                }
                writer.write_record(row.iter().map(|v| v.to_csv_field()))?;
                rows_in_part += 1;
            }
        }
        writer.flush()?;
        bytes += writer.get_ref().bytes();
        Ok(bytes)
    }
}

fn csv_reader(file: &Path) -> Result<csv::Reader<std::fs::File>> {
    let handle =
        std::fs::File::open(file).with_context(|| format!("open {}", file.display()))?;
    Ok(csv::ReaderBuilder::new().flexible(true).from_reader(handle))
}

pub(crate) fn local_path(url: &str) -> String {
    url.strip_prefix("file://").unwrap_or(url).to_string()
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn modified_epoch(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64)
}

fn resolve_projection(headers: &[String], selected: &[String]) -> Result<Vec<usize>> {
    if selected.is_empty() {
        return Ok((0..headers.len()).collect());
    }
    selected
        .iter()
        .map(|name| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or_else(|| anyhow!("column {name} not found in file headers"))
        })
        .collect()
}

fn project(record: &csv::StringRecord, projection: &[usize]) -> Vec<String> {
    projection
        .iter()
        .map(|&i| record.get(i).unwrap_or("").to_string())
        .collect()
}

/// Parse raw fields under the first `arity` columns of the schema
/// (the rest are metadata columns filled separately).
fn parse_record_prefix(columns: &Columns, arity: usize, fields: &[String]) -> Row {
    columns
        .iter()
        .take(arity)
        .enumerate()
        .map(|(i, col)| match fields.get(i) {
            Some(field) => Value::parse_as(col.typ, field),
            None => Value::Null,
        })
        .collect()
}

fn take_one(remaining: &AtomicU64) -> bool {
    let mut current = remaining.load(Ordering::Relaxed);
    loop {
        if current == 0 {
            return false;
        }
        match remaining.compare_exchange_weak(
            current,
            current - 1,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::value::Value;

    fn write_csv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    async fn drain(df: &mut Dataflow) -> Vec<Row> {
        let mut rows = Vec::new();
        for mut stream in df.take_streams() {
            while let Some(batch) = stream.next_batch().await {
                rows.extend(batch);
            }
        }
        rows
    }

    #[tokio::test]
    async fn reads_single_file_with_types() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "t.csv", "id,name,amount\n1,anna,1.5\n2,ben,2\n");
        let client = LocalFsClient::new();
        let url = format!("file://{}/t.csv", dir.path().display());
        let mut df = client
            .read_dataflow(&url, FileStreamConfig::default())
            .await
            .unwrap();
        assert_eq!(df.columns.names(), vec!["id", "name", "amount"]);
        assert_eq!(df.columns[2].typ, ColumnType::Decimal);
        assert_eq!(df.buffer.len(), 2);
        let rows = drain(&mut df).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Int(1));
        assert_eq!(df.count(), 2);
    }

    #[tokio::test]
    async fn projection_and_limit_apply() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "t.csv", "id,name\n1,a\n2,b\n3,c\n");
        let client = LocalFsClient::new();
        let cfg = FileStreamConfig { columns: vec!["name".into()], limit: 2 };
        let mut df = client
            .read_dataflow(&format!("{}/t.csv", dir.path().display()), cfg)
            .await
            .unwrap();
        assert_eq!(df.columns.names(), vec!["name"]);
        let rows = drain(&mut df).await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn zero_files_is_a_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalFsClient::new();
        let err = client
            .read_dataflow(
                &format!("{}/missing/*.csv", dir.path().display()),
                FileStreamConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(sluice_core::error::is_no_files_found(&err));
    }

    #[tokio::test]
    async fn fs_timestamp_filters_old_files() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "t.csv", "id\n1\n");
        let mut props = BTreeMap::new();
        // All files on disk are older than a far-future watermark.
        props.insert(env::FS_TIMESTAMP_PROP.to_string(), "32503680000".to_string());
        let client = LocalFsClient::from_props(&props);
        let err = client
            .read_dataflow(
                &format!("{}/t.csv", dir.path().display()),
                FileStreamConfig::default(),
            )
            .await
            .unwrap_err();
        assert!(sluice_core::error::is_no_files_found(&err));
    }

    #[tokio::test]
    async fn metadata_columns_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "t.csv", "id\n7\n");
        let mut client = LocalFsClient::new();
        client.metadata = FlowMetadata { loaded_at: Some(1700000000), stream_url: true };
        let mut df = client
            .read_dataflow(
                &format!("{}/t.csv", dir.path().display()),
                FileStreamConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            df.columns.names(),
            vec!["id", env::LOADED_AT_COLUMN, env::STREAM_URL_COLUMN]
        );
        let rows = drain(&mut df).await;
        assert_eq!(rows[0][1], Value::Int(1700000000));
        assert!(matches!(&rows[0][2], Value::Text(url) if url.ends_with("t.csv")));
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "in.csv", "id,name\n1,a\n2,b\n");
        let client = LocalFsClient::new();
        let mut df = client
            .read_dataflow(
                &format!("{}/in.csv", dir.path().display()),
                FileStreamConfig::default(),
            )
            .await
            .unwrap();
        let out = format!("{}/out.csv", dir.path().display());
        let bytes = client.write_dataflow(&mut df, &out).await.unwrap();
        assert!(bytes > 0);
        assert_eq!(df.bytes().1, bytes);

        let mut back = client
            .read_dataflow(&out, FileStreamConfig::default())
            .await
            .unwrap();
        let rows = drain(&mut back).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][1], Value::Text("b".into()));
    }

    #[tokio::test]
    async fn row_limit_splits_output_files() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(dir.path(), "in.csv", "id\n1\n2\n3\n");
        let reader = LocalFsClient::new();
        let mut df = reader
            .read_dataflow(
                &format!("{}/in.csv", dir.path().display()),
                FileStreamConfig::default(),
            )
            .await
            .unwrap();

        let mut writer = LocalFsClient::new();
        writer.file_row_limit = 2;
        let out_dir = format!("{}/out", dir.path().display());
        writer.write_dataflow(&mut df, &out_dir).await.unwrap();

        let parts = std::fs::read_dir(&out_dir).unwrap().count();
        assert_eq!(parts, 2);
    }
}
