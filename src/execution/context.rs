//! Per-Run Execution Context
//!
//! State that belongs to one `Engine::run` call. It is built at the start
//! of the call and passed explicitly to every phase, so one engine can
//! serve overlapping runs.

use std::future::Future;
use std::path::{Path, PathBuf};

use futures::future::join_all;
use futures::stream::{self, StreamExt};

use crate::monitoring::StepLog;
use crate::workflow::Step;

/// Working directory and log sink for a single step execution.
pub struct RunContext {
    run_dir: PathBuf,
    log: StepLog,
}

impl RunContext {
    /// Creates the context for `step`, rooted at `{work_root}/{run_name}`.
    pub fn new(work_root: &Path, step: &Step, log: StepLog) -> Self {
        Self {
            run_dir: work_root.join(step.run_name.trim()),
            log,
        }
    }

    /// Directory dependencies are fetched into and capabilities run from.
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Log sink for this run.
    pub fn log(&self) -> &StepLog {
        &self.log
    }
}

/// Drives all futures to completion and returns their outputs in input order.
///
/// With `limit` set, at most that many run at once; otherwise all start
/// together. No branch is cancelled when another fails.
pub async fn fan_out<I, F, T>(futures: I, limit: Option<usize>) -> Vec<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T>,
{
    match limit {
        Some(n) if n > 0 => stream::iter(futures).buffered(n).collect().await,
        _ => join_all(futures).await,
    }
}
