//! Workers: long-lived execution units that run one call at a time.
//!
//! Two kinds exist behind [`WorkerInterface`]:
//!
//! - [`ProcessWorker`] re-executes a host binary in worker mode and talks to
//!   it over pipes (requests on stdin, responses on fd 3).
//! - [`ThreadWorker`] runs the same child runtime on a dedicated thread,
//!   connected by channels.
//!
//! Both own their crash/respawn lifecycle. A crash never settles the pending
//! call with a result; it is reported as [`Completion::Lost`].

pub mod ipc;
pub mod proc;
pub mod process;
pub mod protocol;
pub mod signals;
pub mod spawn;
pub mod thread;

pub use process::ProcessWorker;
pub use signals::TerminationReason;
pub use thread::ThreadWorker;

use crate::config::ForkOptions;
use crate::error::{FarmError, Result};
use crate::module::ModuleRegistry;
use crossbeam_channel::Sender;
use protocol::{ChildMessage, ParentMessage};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// 0-based worker index within a pool. Stable across respawns.
pub type WorkerId = usize;

/// Invoked synchronously when a worker accepts a request.
pub type OnStart = Box<dyn FnOnce(WorkerId) + Send>;
/// Invoked exactly once when the request completes or is lost.
pub type OnEnd = Box<dyn FnOnce(Completion) + Send>;
/// Invoked for every custom message emitted while the request is in flight.
pub type OnCustomMessage = Arc<dyn Fn(Value) + Send + Sync>;

/// How an in-flight request ended.
#[derive(Debug)]
pub enum Completion {
    /// The worker answered (`OK`, `CLIENT_ERROR` or `SETUP_ERROR`) or the
    /// request could not be delivered.
    Finished(Result<Value>),
    /// The execution unit died while the request was in flight.
    Lost(TerminationReason),
}

/// Lifecycle of a worker's execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Ready,
    Busy,
    /// Died unexpectedly; a respawn follows.
    Crashed(TerminationReason),
    /// Exited cleanly without being asked; respawned on the next send.
    Exited,
    Ending,
    Ended,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawning => write!(f, "spawning"),
            Self::Ready => write!(f, "ready"),
            Self::Busy => write!(f, "busy"),
            Self::Crashed(reason) => write!(f, "crashed ({})", reason),
            Self::Exited => write!(f, "exited"),
            Self::Ending => write!(f, "ending"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// Counters for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub state: WorkerState,
    /// Calls that produced a terminal response.
    pub jobs_completed: u64,
    /// Times the execution unit was replaced.
    pub restarts: u64,
}

/// Which stream a forwarded output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of worker output, tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub worker_id: WorkerId,
    pub stream: OutputStream,
    pub line: String,
}

/// Everything a worker needs to (re)spawn its execution unit.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub id: WorkerId,
    pub module: String,
    pub setup_args: Vec<Value>,
    pub fork_options: ForkOptions,
    pub idle_memory_limit_mib: Option<u64>,
    pub registry: ModuleRegistry,
    /// Sink for forwarded stdout/stderr lines.
    pub output: Sender<OutputLine>,
}

impl WorkerOptions {
    /// 1-based ordinal exposed to modules as the worker id.
    pub fn ordinal(&self) -> usize {
        self.id + 1
    }

    pub fn initialize_message(&self) -> ChildMessage {
        ChildMessage::initialize(self.module.clone(), self.setup_args.clone())
    }
}

/// Operations every worker kind supports.
pub trait WorkerInterface: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Send a request. `on_start` runs before the request is written;
    /// `on_end` runs exactly once, outside any worker lock.
    fn send(
        &self,
        request: ChildMessage,
        on_start: OnStart,
        on_end: OnEnd,
        on_custom_message: OnCustomMessage,
    );

    fn state(&self) -> WorkerState;

    fn stats(&self) -> WorkerStats;

    /// OS process id of the current execution unit, if it is a process.
    fn pid(&self) -> Option<u32>;

    /// Stop the execution unit. Returns `true` if it had to be forced.
    fn end(&self, force_exit_delay: Duration) -> bool;
}

/// A worker of either kind. All workers in one pool share the same variant.
pub enum Worker {
    Process(ProcessWorker),
    Thread(ThreadWorker),
}

impl Worker {
    fn inner(&self) -> &dyn WorkerInterface {
        match self {
            Self::Process(worker) => worker,
            Self::Thread(worker) => worker,
        }
    }
}

impl WorkerInterface for Worker {
    fn id(&self) -> WorkerId {
        self.inner().id()
    }

    fn send(
        &self,
        request: ChildMessage,
        on_start: OnStart,
        on_end: OnEnd,
        on_custom_message: OnCustomMessage,
    ) {
        self.inner().send(request, on_start, on_end, on_custom_message)
    }

    fn state(&self) -> WorkerState {
        self.inner().state()
    }

    fn stats(&self) -> WorkerStats {
        self.inner().stats()
    }

    fn pid(&self) -> Option<u32> {
        self.inner().pid()
    }

    fn end(&self, force_exit_delay: Duration) -> bool {
        self.inner().end(force_exit_delay)
    }
}

/// Completion callbacks of the request currently in flight.
pub(crate) struct Pending {
    pub on_end: OnEnd,
    pub on_custom_message: OnCustomMessage,
}

/// What to do with a response once the worker lock is released.
pub(crate) enum Delivery {
    Custom(OnCustomMessage, Value),
    Settle(OnEnd, Result<Value>),
    /// A response arrived with no request in flight.
    Orphan(ParentMessage),
}

impl Delivery {
    /// Run the callback. Must be called without holding the worker lock.
    pub fn deliver(self, worker_id: WorkerId) {
        match self {
            Self::Custom(on_custom_message, payload) => on_custom_message(payload),
            Self::Settle(on_end, result) => on_end(Completion::Finished(result)),
            Self::Orphan(message) => {
                tracing::warn!(worker_id, ?message, "Dropping response with no pending call");
            }
        }
    }
}

/// Match a parent message to the pending request.
///
/// Terminal messages take the pending slot; custom messages leave it in place.
pub(crate) fn route(pending: &mut Option<Pending>, message: ParentMessage) -> Delivery {
    if let ParentMessage::Custom(payload) = message {
        return match pending.as_ref() {
            Some(p) => Delivery::Custom(Arc::clone(&p.on_custom_message), payload),
            None => Delivery::Orphan(ParentMessage::Custom(payload)),
        };
    }

    match pending.take() {
        Some(p) => Delivery::Settle(p.on_end, terminal_result(message)),
        None => Delivery::Orphan(message),
    }
}

fn terminal_result(message: ParentMessage) -> Result<Value> {
    match message {
        ParentMessage::Ok(value) => Ok(value),
        ParentMessage::ClientError(err) => Err(FarmError::Client(err)),
        ParentMessage::SetupError(err) => Err(FarmError::Setup(err)),
        ParentMessage::Custom(_) => Err(FarmError::Protocol(
            "custom message cannot settle a call".to_string(),
        )),
    }
}

/// Lock a mutex, recovering the data if a callback panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
