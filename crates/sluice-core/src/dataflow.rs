//! The streaming bridge between a reader and a writer.
//!
//! A [`Dataflow`] is a composition of one or more [`Datastream`]s of
//! homogenous schema, bridged by bounded channels of row batches. The
//! bounded buffer provides backpressure: the writer's consumption rate
//! throttles the reader. Readers hold [`StreamWriter`] handles; shared
//! state is limited to atomic counters, a cancellation token, and a
//! set-once error slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::columns::Columns;
use crate::dataset::Dataset;
use crate::value::Row;

/// Rows per channel message.
pub const BATCH_ROWS: usize = 1024;

/// Batches buffered per datastream before the reader blocks.
pub const CHANNEL_CAPACITY: usize = 8;

pub type Batch = Vec<Row>;

#[derive(Debug, Default)]
pub struct FlowStats {
    pub rows: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
}

/// First terminal error wins; later errors are logged, not stored.
#[derive(Clone, Default, Debug)]
pub struct ErrorSlot(Arc<Mutex<Option<anyhow::Error>>>);

impl ErrorSlot {
    pub fn set(&self, err: anyhow::Error) {
        let mut slot = self.0.lock().expect("error slot poisoned");
        if slot.is_some() {
            warn!("subsequent dataflow error dropped: {err:#}");
        } else {
            *slot = Some(err);
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().expect("error slot poisoned").is_some()
    }

    pub fn take(&self) -> Option<anyhow::Error> {
        self.0.lock().expect("error slot poisoned").take()
    }
}

/// State shared by every handle of one dataflow.
#[derive(Clone, Debug)]
pub struct FlowShared {
    pub stats: Arc<FlowStats>,
    checksums: Arc<Vec<AtomicU64>>,
    pub err: ErrorSlot,
    pub cancel: CancellationToken,
}

impl FlowShared {
    fn new(arity: usize, cancel: CancellationToken) -> FlowShared {
        FlowShared {
            stats: Arc::new(FlowStats::default()),
            checksums: Arc::new((0..arity).map(|_| AtomicU64::new(0)).collect()),
            err: ErrorSlot::default(),
            cancel,
        }
    }
}

/// Consumer half of one stream of rows.
#[derive(Debug)]
pub struct Datastream {
    pub columns: Columns,
    rx: mpsc::Receiver<Batch>,
    shared: FlowShared,
}

impl Datastream {
    /// A standalone stream with its own shared state, for producers
    /// (API clients) that hand single streams to the engine.
    pub fn channel(columns: Columns, capacity: usize) -> (StreamWriter, Datastream) {
        let shared = FlowShared::new(columns.len(), CancellationToken::new());
        Datastream::channel_with(columns, capacity, shared)
    }

    fn channel_with(
        columns: Columns,
        capacity: usize,
        shared: FlowShared,
    ) -> (StreamWriter, Datastream) {
        let (tx, rx) = mpsc::channel(capacity);
        let writer = StreamWriter {
            tx,
            arity: columns.len(),
            pending: Vec::new(),
            shared: shared.clone(),
        };
        (writer, Datastream { columns, rx, shared })
    }

    /// Next batch, or None when the stream is drained or cancelled.
    pub async fn next_batch(&mut self) -> Option<Batch> {
        tokio::select! {
            _ = self.shared.cancel.cancelled() => None,
            batch = self.rx.recv() => batch,
        }
    }

    pub fn shared(&self) -> FlowShared {
        self.shared.clone()
    }
}

/// Producer half. Enforces schema stability: once columns are fixed,
/// a row with a different arity is a terminal error for the flow.
pub struct StreamWriter {
    tx: mpsc::Sender<Batch>,
    arity: usize,
    pending: Batch,
    shared: FlowShared,
}

impl StreamWriter {
    /// Push one row. `Ok(false)` means the consumer is gone and the
    /// producer should stop.
    pub async fn push(&mut self, row: Row) -> Result<bool> {
        if row.len() != self.arity {
            let err = anyhow!(
                "row arity {} does not match dataflow columns {}",
                row.len(),
                self.arity
            );
            self.shared.err.set(anyhow!("{err}"));
            self.shared.cancel.cancel();
            return Err(err);
        }
        let size: usize = row.iter().map(|v| v.estimated_size() + 1).sum();
        self.shared.stats.rows.fetch_add(1, Ordering::Relaxed);
        self.shared.stats.in_bytes.fetch_add(size as u64, Ordering::Relaxed);
        for (i, value) in row.iter().enumerate() {
            self.shared.checksums[i].fetch_add(value.checksum_component(), Ordering::Relaxed);
        }
        self.pending.push(row);
        if self.pending.len() >= BATCH_ROWS {
            return self.flush().await;
        }
        Ok(true)
    }

    pub async fn flush(&mut self) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(true);
        }
        let batch = std::mem::take(&mut self.pending);
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(anyhow!("dataflow cancelled")),
            sent = self.tx.send(batch) => Ok(sent.is_ok()),
        }
    }

    /// Flush remaining rows and drop the sender, closing the stream.
    pub async fn close(mut self) -> Result<()> {
        self.flush().await?;
        Ok(())
    }

    /// Terminate the whole flow with an error.
    pub fn fail(self, err: anyhow::Error) {
        self.shared.err.set(err);
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// The dataflow handed from a reader to a writer.
///
/// Created by a reader, drained exactly once by a writer, closed on
/// either side's termination. `cleanup` is idempotent.
#[derive(Debug)]
pub struct Dataflow {
    pub columns: Columns,
    /// First rows retained for schema DDL and checksum inspection.
    pub buffer: Vec<Row>,
    /// Direct-load hint: the flow is also available at this URL.
    pub fs_url: Option<String>,
    streams: Vec<Datastream>,
    shared: FlowShared,
}

impl Dataflow {
    pub fn new(columns: Columns) -> Dataflow {
        let shared = FlowShared::new(columns.len(), CancellationToken::new());
        Dataflow { columns, buffer: Vec::new(), fs_url: None, streams: Vec::new(), shared }
    }

    /// Attach a new parallel datastream and return its producer handle.
    pub fn add_stream(&mut self, capacity: usize) -> StreamWriter {
        let (writer, stream) =
            Datastream::channel_with(self.columns.clone(), capacity, self.shared.clone());
        self.streams.push(stream);
        writer
    }

    /// Wrap externally-produced datastreams into a flow. All streams
    /// must share the first stream's schema arity.
    pub fn from_datastreams(streams: Vec<Datastream>) -> Result<Dataflow> {
        let first = streams.first().ok_or_else(|| anyhow!("no datastreams provided"))?;
        let columns = first.columns.clone();
        let shared = first.shared();
        for stream in &streams {
            if stream.columns.len() != columns.len() {
                return Err(anyhow!(
                    "datastream arity {} does not match dataflow columns {}",
                    stream.columns.len(),
                    columns.len()
                ));
            }
        }
        Ok(Dataflow { columns, buffer: Vec::new(), fs_url: None, streams, shared })
    }

    /// Stream an eager dataset, buffering its head for inspection.
    pub fn from_dataset(data: Dataset, buffer_rows: usize) -> Dataflow {
        let mut df = Dataflow::new(data.columns.clone());
        df.buffer = data.rows.iter().take(buffer_rows).cloned().collect();
        let mut writer = df.add_stream(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            for row in data.rows {
                match writer.push(row).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => return,
                }
            }
            if let Err(err) = writer.close().await {
                trace!("dataset flow close: {err:#}");
            }
        });
        df
    }

    pub fn count(&self) -> u64 {
        self.shared.stats.rows.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> (u64, u64) {
        (
            self.shared.stats.in_bytes.load(Ordering::Relaxed),
            self.shared.stats.out_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn add_out_bytes(&self, n: u64) {
        self.shared.stats.out_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Snapshot the per-column checksums accumulated so far.
    pub fn sync_stats(&self) -> Vec<u64> {
        self.shared.checksums.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn stats(&self) -> Arc<FlowStats> {
        self.shared.stats.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn set_err(&self, err: anyhow::Error) {
        self.shared.err.set(err);
    }

    pub fn has_err(&self) -> bool {
        self.shared.err.is_set()
    }

    pub fn take_err(&self) -> Option<anyhow::Error> {
        self.shared.err.take()
    }

    /// Hand the streams to the writer. Called exactly once per flow.
    pub fn take_streams(&mut self) -> Vec<Datastream> {
        std::mem::take(&mut self.streams)
    }

    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Idempotent; safe to call from any exit path.
    pub fn cleanup(&self) {
        self.close();
    }

    /// Funnel all datastreams into one, preserving order within each
    /// stream. Order across streams is not guaranteed.
    pub fn merge(&mut self) -> Datastream {
        let mut streams = self.take_streams();
        if streams.len() == 1 {
            return streams.remove(0);
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let out = Datastream {
            columns: self.columns.clone(),
            rx,
            shared: self.shared.clone(),
        };
        tokio::spawn(async move {
            for mut stream in streams {
                while let Some(batch) = stream.next_batch().await {
                    if tx.send(batch).await.is_err() {
                        return;
                    }
                }
            }
        });
        out
    }
}
