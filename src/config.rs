//! Farm configuration.
//!
//! `FarmOptions` is a plain struct with builder methods. Environment
//! overrides are applied explicitly via [`FarmOptions::with_env_overrides`].
//!
//! # Environment Variables
//!
//! - `WORKFARM_WORKERS` - Number of workers
//! - `WORKFARM_SCHEDULING` - Scheduling policy: in-order, round-robin
//! - `WORKFARM_EXECUTION` - Execution unit: auto, process, thread

use crate::error::{FarmError, Result};
use crate::module::ModuleRegistry;
use clap::ValueEnum;
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// How long `end()` waits for a worker to exit before signalling it.
pub const DEFAULT_FORCE_EXIT_DELAY: Duration = Duration::from_millis(500);

/// Computes the affinity key for a call. `None` means "no affinity".
pub type WorkerKeyFn = Arc<dyn Fn(&str, &[Value]) -> Option<String> + Send + Sync>;

/// Starting-offset policy for unpinned dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SchedulingPolicy {
    /// Always probe from worker 0 (keeps early workers' caches warm).
    InOrder,
    /// Advance the starting worker on every call (spreads load evenly).
    #[default]
    RoundRobin,
}

impl FromStr for SchedulingPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-order" | "in_order" | "inorder" => Ok(Self::InOrder),
            "round-robin" | "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            _ => Err(format!(
                "Unknown scheduling policy: '{}'. Valid options: in-order, round-robin",
                s
            )),
        }
    }
}

impl std::fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InOrder => write!(f, "in-order"),
            Self::RoundRobin => write!(f, "round-robin"),
        }
    }
}

/// Kind of execution unit backing each worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ExecutionKind {
    /// Probe once at pool construction.
    #[default]
    Auto,
    /// One OS process per worker.
    Process,
    /// One OS thread per worker, inside this process.
    Thread,
}

impl FromStr for ExecutionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "process" | "child-process" => Ok(Self::Process),
            "thread" | "threads" => Ok(Self::Thread),
            _ => Err(format!(
                "Unknown execution kind: '{}'. Valid options: auto, process, thread",
                s
            )),
        }
    }
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Process => write!(f, "process"),
            Self::Thread => write!(f, "thread"),
        }
    }
}

/// How worker processes are launched.
#[derive(Debug, Clone, Default)]
pub struct ForkOptions {
    /// Executable hosting the worker entry point (default: the current executable).
    pub program: Option<PathBuf>,
    /// Extra arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Working directory for the child (default: inherited).
    pub cwd: Option<PathBuf>,
}

impl ForkOptions {
    /// Launch workers from `program` instead of the current executable.
    pub fn program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for a [`WorkerFarm`](crate::WorkerFarm).
#[derive(Clone)]
pub struct FarmOptions {
    /// Number of workers in the pool.
    pub num_workers: usize,
    /// Name of the worker module to load in every worker.
    pub module: String,
    /// Arguments passed to the module's `setup`.
    pub setup_args: Vec<Value>,
    pub fork_options: ForkOptions,
    pub execution: ExecutionKind,
    pub scheduling_policy: SchedulingPolicy,
    /// Optional sticky-worker key function.
    pub compute_worker_key: Option<WorkerKeyFn>,
    /// Grace period for workers to exit on `end()`.
    pub force_exit_delay: Duration,
    /// Restart a process worker after a task if its RSS exceeds this (MiB).
    pub idle_memory_limit_mib: Option<u64>,
    /// Modules available to thread workers.
    pub registry: ModuleRegistry,
}

impl std::fmt::Debug for FarmOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmOptions")
            .field("num_workers", &self.num_workers)
            .field("module", &self.module)
            .field("setup_args", &self.setup_args)
            .field("fork_options", &self.fork_options)
            .field("execution", &self.execution)
            .field("scheduling_policy", &self.scheduling_policy)
            .field("compute_worker_key", &self.compute_worker_key.is_some())
            .field("force_exit_delay", &self.force_exit_delay)
            .field("idle_memory_limit_mib", &self.idle_memory_limit_mib)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Default for FarmOptions {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            module: String::new(),
            setup_args: Vec::new(),
            fork_options: ForkOptions::default(),
            execution: ExecutionKind::Auto,
            scheduling_policy: SchedulingPolicy::RoundRobin,
            compute_worker_key: None,
            force_exit_delay: DEFAULT_FORCE_EXIT_DELAY,
            idle_memory_limit_mib: None,
            registry: ModuleRegistry::new(),
        }
    }
}

/// One less than the available parallelism, leaving a core for the scheduler.
pub fn default_num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl FarmOptions {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_setup_args(mut self, setup_args: Vec<Value>) -> Self {
        self.setup_args = setup_args;
        self
    }

    pub fn with_fork_options(mut self, fork_options: ForkOptions) -> Self {
        self.fork_options = fork_options;
        self
    }

    pub fn with_execution(mut self, execution: ExecutionKind) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_scheduling_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduling_policy = policy;
        self
    }

    /// Pin calls with equal keys to the same worker.
    pub fn with_worker_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Option<String> + Send + Sync + 'static,
    {
        self.compute_worker_key = Some(Arc::new(f));
        self
    }

    pub fn with_force_exit_delay(mut self, delay: Duration) -> Self {
        self.force_exit_delay = delay;
        self
    }

    pub fn with_idle_memory_limit(mut self, mib: u64) -> Self {
        self.idle_memory_limit_mib = Some(mib);
        self
    }

    pub fn with_registry(mut self, registry: ModuleRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Invalid values are ignored with a warning rather than failing startup.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("WORKFARM_WORKERS") {
            match value.parse::<usize>() {
                Ok(n) => self.num_workers = n,
                Err(_) => tracing::warn!(value = %value, "Ignoring invalid WORKFARM_WORKERS"),
            }
        }

        if let Ok(value) = std::env::var("WORKFARM_SCHEDULING") {
            match value.parse() {
                Ok(policy) => self.scheduling_policy = policy,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid WORKFARM_SCHEDULING"),
            }
        }

        if let Ok(value) = std::env::var("WORKFARM_EXECUTION") {
            match value.parse() {
                Ok(kind) => self.execution = kind,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid WORKFARM_EXECUTION"),
            }
        }

        self
    }

    /// Check the options before any worker is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(FarmError::Config(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.module.is_empty() {
            return Err(FarmError::Config("module name must not be empty".to_string()));
        }
        Ok(())
    }
}
