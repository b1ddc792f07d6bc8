//! workfarm - a farm of worker processes (or threads) behind a call/response API.
//!
//! A [`WorkerFarm`] owns a fixed pool of workers, each hosting one named
//! [`WorkerModule`]. Calls are queued in submission order and handed to the
//! first idle worker, optionally pinned to a worker by an affinity key.
//! Crashed workers are respawned transparently.
//!
//! Process workers re-execute a host binary that must call
//! [`child::run_if_worker`] first thing in `main`:
//!
//! ```no_run
//! fn main() {
//!     workfarm::child::run_if_worker(&workfarm::demo::registry());
//!     // ... regular program ...
//! }
//! ```

pub mod child;
pub mod config;
pub mod demo;
pub mod error;
pub mod farm;
pub mod logging;
pub mod module;
pub mod pool;
pub mod queue;
pub mod task;
pub mod worker;
pub mod worker_farm;

pub use config::{ExecutionKind, FarmOptions, ForkOptions, SchedulingPolicy};
pub use error::{ClientError, FarmError, Result, SetupError};
pub use module::{CallContext, MethodTable, ModuleRegistry, WorkerModule};
pub use pool::{PoolEndResult, PoolStats, WorkerPool};
pub use task::{Subscription, WorkHandle};
pub use worker::{OutputLine, OutputStream, WorkerState, WorkerStats};
pub use worker_farm::{FarmStats, WorkerFarm};
