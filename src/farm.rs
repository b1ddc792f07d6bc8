//! The scheduler.
//!
//! Accepts calls, applies worker affinity and the selection policy, keeps at
//! most one task in flight per worker and drains the queue as workers free
//! up. All bookkeeping lives behind one mutex; the dispatcher and every
//! completion callback are invoked outside it.

use crate::config::{SchedulingPolicy, WorkerKeyFn};
use crate::error::{FarmError, Result};
use crate::queue::{FifoQueue, TaskQueue};
use crate::task::{CallRequest, Task, WorkHandle};
use crate::worker::protocol::ChildMessage;
use crate::worker::{Completion, OnCustomMessage, OnEnd, OnStart, WorkerId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{trace, warn};

/// Something that can run a request on a numbered worker.
///
/// Implemented by [`WorkerPool`](crate::pool::WorkerPool); tests script it.
pub trait Dispatch: Send + Sync + 'static {
    fn worker_count(&self) -> usize;

    fn send(
        &self,
        worker_id: WorkerId,
        request: ChildMessage,
        on_start: OnStart,
        on_end: OnEnd,
        on_custom_message: OnCustomMessage,
    );
}

impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    fn worker_count(&self) -> usize {
        (**self).worker_count()
    }

    fn send(
        &self,
        worker_id: WorkerId,
        request: ChildMessage,
        on_start: OnStart,
        on_end: OnEnd,
        on_custom_message: OnCustomMessage,
    ) {
        (**self).send(worker_id, request, on_start, on_end, on_custom_message)
    }
}

/// Task scheduler over a [`Dispatch`]er. Cheap to clone.
pub struct Farm<D: Dispatch> {
    inner: Arc<FarmInner<D>>,
}

impl<D: Dispatch> Clone for Farm<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct FarmInner<D> {
    dispatcher: D,
    num_workers: usize,
    compute_worker_key: Option<WorkerKeyFn>,
    policy: SchedulingPolicy,
    state: Mutex<SchedState>,
}

struct SchedState {
    /// Per-worker concurrency lock
    busy: Vec<bool>,
    /// Set while a `process` loop for the worker is on some stack
    draining: Vec<bool>,
    queue: Box<dyn TaskQueue>,
    affinity: HashMap<String, WorkerId>,
    offset: usize,
    next_seq: u64,
    ended: bool,
    /// Tasks whose worker died mid-call; kept unsettled until `end()`
    lost: Vec<Arc<Task>>,
}

impl<D: Dispatch> Farm<D> {
    pub fn new(
        dispatcher: D,
        policy: SchedulingPolicy,
        compute_worker_key: Option<WorkerKeyFn>,
    ) -> Result<Self> {
        Self::with_queue(dispatcher, policy, compute_worker_key, Box::new(FifoQueue::new()))
    }

    /// Create a farm over a custom queue implementation.
    pub fn with_queue(
        dispatcher: D,
        policy: SchedulingPolicy,
        compute_worker_key: Option<WorkerKeyFn>,
        queue: Box<dyn TaskQueue>,
    ) -> Result<Self> {
        let num_workers = dispatcher.worker_count();
        if num_workers == 0 {
            return Err(FarmError::Config(
                "a farm needs at least one worker".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(FarmInner {
                dispatcher,
                num_workers,
                compute_worker_key,
                policy,
                state: Mutex::new(SchedState {
                    busy: vec![false; num_workers],
                    draining: vec![false; num_workers],
                    queue,
                    affinity: HashMap::new(),
                    offset: 0,
                    next_seq: 0,
                    ended: false,
                    lost: Vec::new(),
                }),
            }),
        })
    }

    pub fn dispatcher(&self) -> &D {
        &self.inner.dispatcher
    }

    fn state(&self) -> MutexGuard<'_, SchedState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a call. Never blocks; every outcome surfaces through the handle.
    pub fn do_work(&self, method: impl Into<String>, args: Vec<Value>) -> WorkHandle {
        let request = CallRequest::new(method, args);
        let hash = self
            .inner
            .compute_worker_key
            .as_ref()
            .and_then(|key| key(&request.method, &request.args));

        let mut state = self.state();
        let seq = state.next_seq;
        state.next_seq += 1;
        let (task, handle) = Task::new(seq, request, hash);

        if state.ended {
            drop(state);
            task.finish(Err(FarmError::Ended));
            return handle;
        }

        let task = Arc::new(task);
        let bound = task
            .hash
            .as_ref()
            .and_then(|hash| state.affinity.get(hash).copied());

        if let Some(worker_id) = bound {
            state.queue.enqueue(task, Some(worker_id));
            drop(state);
            self.process(worker_id);
            return handle;
        }

        state.queue.enqueue(Arc::clone(&task), None);
        let n = self.inner.num_workers;
        let offset = match self.inner.policy {
            SchedulingPolicy::InOrder => 0,
            SchedulingPolicy::RoundRobin => {
                let offset = state.offset;
                state.offset = (offset + 1) % n;
                offset
            }
        };
        drop(state);

        for i in 0..n {
            self.process((offset + i) % n);
            if task.is_processed() {
                break;
            }
        }
        handle
    }

    /// Hand queued tasks to `worker_id` for as long as it is free.
    ///
    /// At most one drain per worker runs at a time. A completion that fires
    /// inside `send` lands here while that worker's drain is still on the
    /// stack and returns at once; the running drain picks the next task up,
    /// so synchronous failures are handled in a loop rather than by recursion.
    pub fn process(&self, worker_id: WorkerId) {
        {
            let mut state = self.state();
            if state.draining[worker_id] {
                return;
            }
            state.draining[worker_id] = true;
        }

        loop {
            let (claimed, rerouted) = self.claim(worker_id);
            for bound in rerouted {
                self.process(bound);
            }
            match claimed {
                Some(task) => self.dispatch(worker_id, task),
                None => break,
            }
        }
    }

    /// Take the next eligible task for `worker_id` and mark the worker busy.
    ///
    /// Clears the drain flag when nothing is claimed, under the same lock, so
    /// a completion racing with the end of a drain is never missed.
    fn claim(&self, worker_id: WorkerId) -> (Option<Arc<Task>>, Vec<WorkerId>) {
        let mut rerouted = Vec::new();
        let mut state = self.state();
        if state.busy[worker_id] {
            state.draining[worker_id] = false;
            return (None, rerouted);
        }

        while let Some(task) = state.queue.dequeue(worker_id) {
            // Bound elsewhere while it waited unpinned
            if let Some(bound) = task
                .hash
                .as_ref()
                .and_then(|hash| state.affinity.get(hash).copied())
                && bound != worker_id
            {
                trace!(seq = task.seq, from = worker_id, to = bound, "Re-routing task");
                state.queue.enqueue(task, Some(bound));
                if !rerouted.contains(&bound) {
                    rerouted.push(bound);
                }
                continue;
            }

            if task.mark_processed() {
                panic!("Task {} was dispatched twice", task.seq);
            }
            state.busy[worker_id] = true;
            task.on_start(&mut state.affinity, worker_id);
            return (Some(task), rerouted);
        }

        state.draining[worker_id] = false;
        (None, rerouted)
    }

    fn dispatch(&self, worker_id: WorkerId, task: Arc<Task>) {
        let request =
            ChildMessage::claimed_call(task.request.method.clone(), task.request.args.clone());

        let seq = task.seq;
        let on_start: OnStart = Box::new(move |worker_id| {
            trace!(seq, worker_id, "Task started");
        });

        let listener_task = Arc::clone(&task);
        let on_custom_message: OnCustomMessage =
            Arc::new(move |payload| listener_task.emit(&payload));

        let farm = self.clone();
        let on_end: OnEnd = Box::new(move |completion| farm.complete(worker_id, task, completion));

        self.inner
            .dispatcher
            .send(worker_id, request, on_start, on_end, on_custom_message);
    }

    fn complete(&self, worker_id: WorkerId, task: Arc<Task>, completion: Completion) {
        match completion {
            Completion::Finished(result) => {
                task.finish(result);
                self.state().busy[worker_id] = false;
            }
            Completion::Lost(reason) => {
                warn!(
                    worker_id,
                    seq = task.seq,
                    method = %task.request.method,
                    reason = %reason,
                    "Call lost to a worker crash"
                );
                let mut state = self.state();
                state.busy[worker_id] = false;
                if state.ended {
                    drop(state);
                    task.finish(Err(FarmError::Ended));
                } else {
                    state.lost.push(task);
                }
            }
        }

        self.process(worker_id);
    }

    /// Stop accepting calls and reject everything that has not run.
    ///
    /// Queued calls and calls lost to crashes resolve to [`FarmError::Ended`].
    /// Calls already in flight settle normally.
    pub fn end(&self) {
        let (queued, lost) = {
            let mut state = self.state();
            state.ended = true;
            (state.queue.drain(), std::mem::take(&mut state.lost))
        };

        for task in queued.iter().chain(lost.iter()) {
            task.finish(Err(FarmError::Ended));
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state().ended
    }

    /// Number of handles parked because their worker crashed.
    pub fn lost_tasks(&self) -> usize {
        self.state().lost.len()
    }

    /// Number of calls waiting for a worker.
    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    /// Worker bound to an affinity key, if any.
    pub fn bound_worker(&self, key: &str) -> Option<WorkerId> {
        self.state().affinity.get(key).copied()
    }
}
