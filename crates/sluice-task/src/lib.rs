//! # Sluice Task
//!
//! The execution core: given a [`sluice_core::Config`], a
//! [`TaskExecution`] dispatches one of seven pipeline variants, runs
//! the streaming read/write on a worker task, and owns the lifecycle:
//! cancellation, the LIFO cleanup stack, progress accounting, and the
//! final status.
//!
//! ## Pipeline variants
//!
//! | type | flow |
//! |------|------|
//! | `DbSql` | execute SQL on the target database |
//! | `FileToDb` / `DbToDb` / `ApiToDb` | read → stage into a temp table → promote per load mode |
//! | `DbToFile` / `FileToFile` / `ApiToFile` | read → write files or stdout |
//!
//! Database writes follow a staging-and-promote protocol: rows bulk
//! load into `<target>_tmp`, a row-count assertion and checksum check
//! gate the promote, and the promote itself runs in a serializable
//! transaction so a failure leaves the target at its pre-task state.

mod incremental;
mod progress;
mod promote;
mod read;
mod task;
mod worker;
mod write;

pub use progress::ProcStats;
pub use task::{ExecStatus, TaskExecution, TaskState};
