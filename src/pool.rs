//! Worker pool.
//!
//! Owns a fixed set of workers, all of the same kind, and routes requests to
//! them by index.

use crate::child;
use crate::config::{ExecutionKind, FarmOptions};
use crate::error::{FarmError, Result};
use crate::farm::Dispatch;
use crate::worker::protocol::ChildMessage;
use crate::worker::{
    OnCustomMessage, OnEnd, OnStart, OutputLine, ProcessWorker, ThreadWorker, Worker, WorkerId,
    WorkerInterface, WorkerOptions, WorkerStats,
};
use crossbeam_channel::{Receiver, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Capacity of the aggregated output channel. Lines beyond it are dropped.
const OUTPUT_CAPACITY: usize = 1024;

/// Pick the execution-unit kind for `options`.
///
/// `Auto` chooses processes when a worker host binary is available: either
/// an explicit `fork_options.program`, or the current executable after it
/// called [`child::run_if_worker`]. Otherwise threads.
pub fn resolve_execution_kind(options: &FarmOptions) -> ExecutionKind {
    match options.execution {
        ExecutionKind::Auto => {
            if options.fork_options.program.is_some() || child::worker_entry_installed() {
                ExecutionKind::Process
            } else {
                ExecutionKind::Thread
            }
        }
        kind => kind,
    }
}

/// A pool of workers.
pub struct WorkerPool {
    workers: Vec<Worker>,
    kind: ExecutionKind,
    output: Receiver<OutputLine>,
    force_exit_delay: Duration,
    ended: AtomicBool,
}

impl WorkerPool {
    /// Create the pool and start every worker.
    pub fn new(options: &FarmOptions) -> Result<Self> {
        options.validate()?;
        let kind = resolve_execution_kind(options);
        let (output_tx, output) = bounded(OUTPUT_CAPACITY);

        info!(
            workers = options.num_workers,
            kind = %kind,
            module = %options.module,
            "Starting worker pool"
        );

        let mut workers = Vec::with_capacity(options.num_workers);
        for id in 0..options.num_workers {
            let worker_options = WorkerOptions {
                id,
                module: options.module.clone(),
                setup_args: options.setup_args.clone(),
                fork_options: options.fork_options.clone(),
                idle_memory_limit_mib: options.idle_memory_limit_mib,
                registry: options.registry.clone(),
                output: output_tx.clone(),
            };
            let worker = match kind {
                ExecutionKind::Thread => Worker::Thread(ThreadWorker::new(worker_options)?),
                _ => Worker::Process(ProcessWorker::new(worker_options)?),
            };
            workers.push(worker);
        }

        Ok(Self {
            workers,
            kind,
            output,
            force_exit_delay: options.force_exit_delay,
            ended: AtomicBool::new(false),
        })
    }

    /// The resolved execution kind (never `Auto`).
    pub fn kind(&self) -> ExecutionKind {
        self.kind
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Lines written to stdout/stderr by any worker process.
    pub fn output(&self) -> Receiver<OutputLine> {
        self.output.clone()
    }

    /// Current process ids, indexed by worker. Thread workers report `None`.
    pub fn pids(&self) -> Vec<Option<u32>> {
        self.workers.iter().map(WorkerInterface::pid).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let workers: Vec<WorkerStats> = self.workers.iter().map(WorkerInterface::stats).collect();
        PoolStats {
            worker_count: workers.len(),
            kind: self.kind,
            total_jobs_completed: workers.iter().map(|w| w.jobs_completed).sum(),
            total_restarts: workers.iter().map(|w| w.restarts).sum(),
            workers,
        }
    }

    /// Stop every worker, forcing those that outlive `force_exit_delay`.
    ///
    /// Workers are stopped in parallel. Ending twice is an error.
    pub fn end(&self) -> Result<PoolEndResult> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Err(FarmError::Ended);
        }

        let delay = self.force_exit_delay;
        let force_exited = std::thread::scope(|scope| {
            let stops: Vec<_> = self
                .workers
                .iter()
                .map(|worker| scope.spawn(move || worker.end(delay)))
                .collect();
            stops
                .into_iter()
                .map(|stop| stop.join().unwrap_or(true))
                .collect::<Vec<bool>>()
        })
        .into_iter()
        .any(|forced| forced);

        info!(force_exited, "Worker pool ended");
        Ok(PoolEndResult { force_exited })
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl Dispatch for WorkerPool {
    fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn send(
        &self,
        worker_id: WorkerId,
        request: ChildMessage,
        on_start: OnStart,
        on_end: OnEnd,
        on_custom_message: OnCustomMessage,
    ) {
        match self.workers.get(worker_id) {
            Some(worker) => worker.send(request, on_start, on_end, on_custom_message),
            None => on_end(crate::worker::Completion::Finished(Err(FarmError::Worker(
                format!("No worker with id {}", worker_id),
            )))),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_ended() {
            let _ = self.end();
        }
    }
}

/// Outcome of [`WorkerPool::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEndResult {
    /// At least one worker had to be signalled (or, for threads, abandoned).
    pub force_exited: bool,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub worker_count: usize,
    pub kind: ExecutionKind,
    pub total_jobs_completed: u64,
    pub total_restarts: u64,
    pub workers: Vec<WorkerStats>,
}
