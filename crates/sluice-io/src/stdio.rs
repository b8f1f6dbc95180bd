use std::io::Write;

use anyhow::{Context, Result};
use sluice_core::columns::infer_from_records;
use sluice_core::dataflow::{Dataflow, Datastream, CHANNEL_CAPACITY};
use sluice_core::dataset::parse_record;
use tracing::debug;

/// Wrap standard input (CSV with headers) as a single-stream dataflow.
///
/// The first `sample_size` records are buffered for schema inference
/// and retained on the flow; the rest stream through unbuffered.
pub async fn read_stdin_dataflow(sample_size: usize) -> Result<Dataflow> {
    let mut reader = csv::ReaderBuilder::new().from_reader(std::io::stdin());
    let names: Vec<String> = reader
        .headers()
        .context("reading csv header from stdin")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut sample: Vec<Vec<String>> = Vec::new();
    for record in reader.records().take(sample_size) {
        let record = record.context("reading csv from stdin")?;
        sample.push(record.iter().map(|f| f.to_string()).collect());
    }
    let columns = infer_from_records(&names, &sample, true);

    let mut df = Dataflow::new(columns.clone());
    df.buffer = sample.iter().map(|r| parse_record(&columns, r)).collect();
    let buffered = df.buffer.clone();

    let mut writer = df.add_stream(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        for row in buffered {
            match writer.push(row).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return,
            }
        }
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(err) => {
                    writer.fail(anyhow::Error::new(err).context("reading csv from stdin"));
                    return;
                }
            };
            let fields: Vec<String> = record.iter().map(|f| f.to_string()).collect();
            match writer.push(parse_record(&columns, &fields)).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return,
            }
        }
        if let Err(err) = writer.close().await {
            debug!("stdin flow close: {err:#}");
        }
    });
    Ok(df)
}

/// Write a merged datastream to standard output as comma-delimited
/// CSV. Returns (rows, bytes) written.
pub async fn write_stdout_stream(mut stream: Datastream) -> Result<(u64, u64)> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b',')
        .from_writer(CountingWriter::new(std::io::stdout()));
    writer.write_record(stream.columns.names())?;
    let mut rows = 0u64;
    while let Some(batch) = stream.next_batch().await {
        for row in batch {
            writer.write_record(row.iter().map(|v| v.to_csv_field()))?;
            rows += 1;
        }
    }
    writer.flush()?;
    let bytes = writer.get_ref().bytes();
    Ok((rows, bytes))
}

/// io::Write adapter that counts bytes passed through.
pub(crate) struct CountingWriter<W> {
    inner: W,
    bytes: u64,
}

impl<W: Write> CountingWriter<W> {
    pub(crate) fn new(inner: W) -> CountingWriter<W> {
        CountingWriter { inner, bytes: 0 }
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
