use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use sluice_core::config::{Config, TaskType};
use sluice_core::dataflow::FlowStats;
use sluice_core::env::RuntimeFlags;
use sluice_core::error::TaskError;
use sluice_core::drivers::{ApiConn, DbConn, FsClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress::{self, RateSample};
use crate::worker::TaskWorker;

/// How long a cancelled worker gets to wind down before the task
/// concludes "Execution interrupted".
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Created,
    Running,
    Success,
    Error,
}

pub type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// State shared between the executor, its worker task, and observers:
/// the cancellation token, the cleanup stack, the progress line, and
/// the current dataflow's counters.
pub struct TaskState {
    pub cancel: CancellationToken,
    progress: Mutex<String>,
    bar: ProgressBar,
    cleanup: tokio::sync::Mutex<Vec<Option<CleanupFn>>>,
    flow_stats: Mutex<Option<Arc<FlowStats>>>,
    pub(crate) rate: Mutex<RateSample>,
}

impl TaskState {
    fn new() -> Arc<TaskState> {
        Arc::new(TaskState {
            cancel: CancellationToken::new(),
            progress: Mutex::new(String::new()),
            bar: ProgressBar::new_spinner(),
            cleanup: tokio::sync::Mutex::new(Vec::new()),
            flow_stats: Mutex::new(None),
            rate: Mutex::new(RateSample::default()),
        })
    }

    /// Update the single progress string and redraw the terminal bar.
    pub fn set_progress(&self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("{msg}");
        *self.progress.lock().expect("progress poisoned") = msg.clone();
        self.bar.set_message(msg);
    }

    pub fn progress(&self) -> String {
        self.progress.lock().expect("progress poisoned").clone()
    }

    /// Push a cleanup action. The stack drains in LIFO order and each
    /// slot runs at most once.
    pub async fn add_cleanup(&self, f: CleanupFn) {
        self.cleanup.lock().await.push(Some(f));
    }

    /// Drain the cleanup stack. Idempotent: executed slots are left
    /// empty, so concurrent or repeated drains are no-ops.
    pub async fn run_cleanup(&self) {
        let mut stack = self.cleanup.lock().await;
        for slot in stack.iter_mut().rev() {
            if let Some(f) = slot.take() {
                f().await;
            }
        }
    }

    pub(crate) fn attach_flow(&self, stats: Arc<FlowStats>) {
        *self.flow_stats.lock().expect("flow stats poisoned") = Some(stats);
    }

    /// (rows, in_bytes, out_bytes) of the current dataflow.
    pub fn counters(&self) -> (u64, u64, u64) {
        match &*self.flow_stats.lock().expect("flow stats poisoned") {
            Some(stats) => {
                use std::sync::atomic::Ordering::Relaxed;
                (
                    stats.rows.load(Relaxed),
                    stats.in_bytes.load(Relaxed),
                    stats.out_bytes.load(Relaxed),
                )
            }
            None => (0, 0, 0),
        }
    }
}

/// Runtime state for one task run, derived from an immutable Config.
///
/// `execute` is blocking and returns only after cleanup has begun. It
/// is not re-entrant for a given TaskExecution.
pub struct TaskExecution {
    pub config: Config,
    pub task_type: TaskType,
    pub flags: RuntimeFlags,
    pub status: ExecStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub proc_stats_start: ProcStatsStart,
    state: Arc<TaskState>,
    /// Injected driver handles; resolved from the connection URLs when
    /// absent.
    pub src_db: Option<DbConn>,
    pub tgt_db: Option<DbConn>,
    pub fs: Option<FsClient>,
    pub api: Option<ApiConn>,
}

pub type ProcStatsStart = progress::ProcStats;

impl TaskExecution {
    pub fn new(config: Config) -> Result<TaskExecution> {
        TaskExecution::with_flags(config, RuntimeFlags::from_env())
    }

    pub fn with_flags(mut config: Config, flags: RuntimeFlags) -> Result<TaskExecution> {
        config.set_default();
        let task_type = config.task_type()?;
        Ok(TaskExecution {
            config,
            task_type,
            flags,
            status: ExecStatus::Created,
            started_at: None,
            start_time: None,
            end_time: None,
            proc_stats_start: ProcStatsStart::default(),
            state: TaskState::new(),
            src_db: None,
            tgt_db: None,
            fs: None,
            api: None,
        })
    }

    /// Cancelling this token interrupts the run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub fn state(&self) -> Arc<TaskState> {
        self.state.clone()
    }

    pub fn progress(&self) -> String {
        self.state.progress()
    }

    /// Run the task to completion, cancellation, or error.
    pub async fn execute(&mut self) -> Result<()> {
        let now = Instant::now();
        self.start_time = Some(now);
        self.started_at = Some(Utc::now());
        self.state.rate.lock().expect("rate poisoned").last_increment = now;
        self.proc_stats_start = progress::read_proc_stats();
        self.config.set_default();
        self.status = ExecStatus::Running;
        debug!("type is {}", self.task_type);

        let worker = TaskWorker::new(self);
        let mut handle = tokio::spawn(worker.run());

        let result = tokio::select! {
            joined = &mut handle => flatten_join(joined),
            _ = self.state.cancel.cancelled() => {
                // Cleanup starts immediately; the worker gets a grace
                // window to notice the cancellation and unwind.
                let state = self.state.clone();
                tokio::spawn(async move { state.run_cleanup().await });
                match tokio::time::timeout(CANCEL_GRACE, &mut handle).await {
                    Ok(joined) => match flatten_join(joined) {
                        Ok(()) => Err(anyhow!(TaskError::Interrupted)),
                        Err(err) => Err(err.context(TaskError::Interrupted)),
                    },
                    Err(_) => {
                        handle.abort();
                        warn!("worker did not stop within the cancellation grace window");
                        Err(anyhow!(TaskError::Interrupted))
                    }
                }
            }
        };

        self.state.run_cleanup().await;
        self.end_time = Some(Instant::now());
        self.state.bar.finish_and_clear();

        match result {
            Ok(()) => {
                self.state.set_progress("execution succeeded");
                self.status = ExecStatus::Success;
                Ok(())
            }
            Err(err) => {
                self.state.set_progress("execution failed");
                self.status = ExecStatus::Error;
                Err(err.context("execution failed"))
            }
        }
    }
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    joined.context("task worker panicked")?
}
