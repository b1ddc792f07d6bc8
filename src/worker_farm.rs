//! Public entry point: a worker pool driven by a farm.

use crate::config::{ExecutionKind, FarmOptions};
use crate::error::Result;
use crate::farm::Farm;
use crate::pool::{PoolEndResult, PoolStats, WorkerPool};
use crate::task::WorkHandle;
use crate::worker::OutputLine;
use crossbeam_channel::Receiver;
use serde_json::Value;
use std::sync::Arc;

/// A pool of workers plus the scheduler that feeds them.
///
/// ```no_run
/// use serde_json::json;
/// use workfarm::{FarmOptions, WorkerFarm, demo};
///
/// let options = FarmOptions::new("demo")
///     .with_workers(2)
///     .with_registry(demo::registry());
/// let farm = WorkerFarm::new(options)?;
/// let sum = farm.call("add", vec![json!(1), json!(2)]).wait()?;
/// assert_eq!(sum, json!(3));
/// farm.end()?;
/// # Ok::<(), workfarm::FarmError>(())
/// ```
pub struct WorkerFarm {
    farm: Farm<Arc<WorkerPool>>,
    pool: Arc<WorkerPool>,
}

impl WorkerFarm {
    pub fn new(options: FarmOptions) -> Result<Self> {
        let pool = Arc::new(WorkerPool::new(&options)?);
        let farm = Farm::new(
            Arc::clone(&pool),
            options.scheduling_policy,
            options.compute_worker_key.clone(),
        )?;
        Ok(Self { farm, pool })
    }

    /// Call `method` on some worker.
    pub fn call(&self, method: impl Into<String>, args: Vec<Value>) -> WorkHandle {
        self.farm.do_work(method, args)
    }

    /// Aggregated stdout/stderr lines of the worker processes.
    pub fn output(&self) -> Receiver<OutputLine> {
        self.pool.output()
    }

    pub fn kind(&self) -> ExecutionKind {
        self.pool.kind()
    }

    pub fn worker_pids(&self) -> Vec<Option<u32>> {
        self.pool.pids()
    }

    pub fn stats(&self) -> FarmStats {
        FarmStats {
            pool: self.pool.stats(),
            queued: self.farm.queued(),
            lost_tasks: self.farm.lost_tasks(),
        }
    }

    /// Reject pending calls and stop every worker.
    ///
    /// Ending twice returns [`FarmError::Ended`](crate::FarmError::Ended).
    pub fn end(&self) -> Result<PoolEndResult> {
        self.farm.end();
        self.pool.end()
    }
}

impl Drop for WorkerFarm {
    fn drop(&mut self) {
        if !self.pool.is_ended() {
            let _ = self.end();
        }
    }
}

/// Snapshot of a farm's counters.
#[derive(Debug, Clone)]
pub struct FarmStats {
    pub pool: PoolStats,
    /// Calls waiting for a free worker
    pub queued: usize,
    /// Calls whose worker crashed while running them
    pub lost_tasks: usize,
}
