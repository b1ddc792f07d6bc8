//! Thread-backed worker.
//!
//! Runs the child runtime on a dedicated thread connected by channels. A
//! module panic kills the thread, which is this kind's equivalent of a crash:
//! the pending call is lost and a fresh thread takes over.

use super::protocol::{ChildMessage, ParentMessage};
use super::signals::{TerminationReason, panic_message};
use super::spawn::spawn_named_thread;
use super::{
    Completion, Delivery, OnCustomMessage, OnEnd, OnStart, Pending, WorkerId, WorkerInterface,
    WorkerOptions, WorkerState, WorkerStats, lock, route,
};
use crate::child::{ChildRuntime, Flow};
use crate::config::DEFAULT_FORCE_EXIT_DELAY;
use crate::error::{FarmError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

/// A worker whose execution unit is a thread in this process.
pub struct ThreadWorker {
    shared: Arc<Shared>,
}

struct Shared {
    options: WorkerOptions,
    inner: Mutex<Inner>,
}

struct Inner {
    state: WorkerState,
    unit: Option<Unit>,
    pending: Option<Pending>,
    generation: u64,
    jobs_completed: u64,
    restarts: u64,
}

/// Channels into a running unit thread.
struct Unit {
    requests: Sender<ChildMessage>,
    /// Disconnects once the unit thread has been joined
    done: Receiver<()>,
}

impl ThreadWorker {
    /// Start the unit thread and send it `INITIALIZE`.
    pub fn new(options: WorkerOptions) -> Result<Self> {
        let shared = Arc::new(Shared {
            options,
            inner: Mutex::new(Inner {
                state: WorkerState::Spawning,
                unit: None,
                pending: None,
                generation: 0,
                jobs_completed: 0,
                restarts: 0,
            }),
        });

        {
            let mut inner = lock(&shared.inner);
            shared.spawn_locked(&mut inner)?;
        }

        Ok(Self { shared })
    }
}

impl Shared {
    fn id(&self) -> WorkerId {
        self.options.id
    }

    fn spawn_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        inner.state = WorkerState::Spawning;
        inner.generation += 1;

        match self.start_unit(inner.generation) {
            Ok(unit) => {
                inner.unit = Some(unit);
                inner.state = WorkerState::Ready;
                Ok(())
            }
            Err(e) => {
                inner.state = WorkerState::Exited;
                Err(e)
            }
        }
    }

    fn start_unit(self: &Arc<Self>, generation: u64) -> Result<Unit> {
        let id = self.id();
        let (request_tx, request_rx) = unbounded::<ChildMessage>();
        let (response_tx, response_rx) = unbounded::<ParentMessage>();
        let (done_tx, done_rx) = bounded::<()>(0);

        request_tx
            .send(self.options.initialize_message())
            .map_err(|_| FarmError::Worker("Worker thread is not running".into()))?;

        let mut runtime = ChildRuntime::new(self.options.registry.clone(), self.options.ordinal());
        let unit = spawn_named_thread(format!("workfarm-worker-{}", id), move || {
            for message in request_rx.iter() {
                let flow = runtime.handle(message, &mut |response| {
                    let _ = response_tx.send(response);
                });
                if flow == Flow::Exit {
                    break;
                }
            }
        })?;

        let shared = Arc::clone(self);
        spawn_named_thread(format!("workfarm-collector-{}", id), move || {
            shared.collect(generation, response_rx, unit);
            drop(done_tx);
        })?;

        Ok(Unit {
            requests: request_tx,
            done: done_rx,
        })
    }

    fn respawn_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        self.spawn_locked(inner)?;
        inner.restarts += 1;
        debug!(worker_id = self.id(), restarts = inner.restarts, "Worker thread respawned");
        Ok(())
    }

    fn collect(
        self: &Arc<Self>,
        generation: u64,
        responses: Receiver<ParentMessage>,
        unit: JoinHandle<()>,
    ) {
        for message in responses.iter() {
            self.on_message(generation, message);
        }

        // The unit dropped its sender: it returned or unwound.
        let reason = match unit.join() {
            Ok(()) => TerminationReason::Exited(0),
            Err(payload) => TerminationReason::Panicked(panic_message(payload.as_ref())),
        };
        self.on_exit(generation, reason);
    }

    fn on_message(&self, generation: u64, message: ParentMessage) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return;
        }

        let delivery = route(&mut inner.pending, message);
        if let Delivery::Settle(..) = delivery {
            inner.jobs_completed += 1;
            inner.state = WorkerState::Ready;
        }
        drop(inner);

        delivery.deliver(self.id());
    }

    fn on_exit(self: &Arc<Self>, generation: u64, reason: TerminationReason) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return;
        }
        inner.unit = None;
        let pending = inner.pending.take();

        if reason.is_crash() {
            warn!(
                worker_id = self.id(),
                reason = %reason,
                lost_call = pending.is_some(),
                "Worker thread crashed, respawning"
            );
            inner.state = WorkerState::Crashed(reason.clone());
            if let Err(e) = self.respawn_locked(&mut inner) {
                error!(worker_id = self.id(), error = %e, "Failed to respawn worker thread");
                inner.state = WorkerState::Crashed(reason.clone());
            }
        } else {
            inner.state = WorkerState::Exited;
        }
        drop(inner);

        if let Some(pending) = pending {
            (pending.on_end)(Completion::Lost(reason));
        }
    }
}

impl WorkerInterface for ThreadWorker {
    fn id(&self) -> WorkerId {
        self.shared.id()
    }

    fn send(
        &self,
        request: ChildMessage,
        on_start: OnStart,
        on_end: OnEnd,
        on_custom_message: OnCustomMessage,
    ) {
        on_start(self.id());

        let mut inner = lock(&self.shared.inner);
        if matches!(inner.state, WorkerState::Ending | WorkerState::Ended) {
            drop(inner);
            on_end(Completion::Finished(Err(FarmError::Ended)));
            return;
        }

        if inner.unit.is_none()
            && let Err(e) = self.shared.respawn_locked(&mut inner)
        {
            drop(inner);
            on_end(Completion::Finished(Err(e)));
            return;
        }

        let sent = inner
            .unit
            .as_ref()
            .is_some_and(|unit| unit.requests.send(request).is_ok());
        if sent {
            inner.pending = Some(Pending {
                on_end,
                on_custom_message,
            });
            inner.state = WorkerState::Busy;
            return;
        }

        // The unit thread is gone; its collector will respawn it.
        drop(inner);
        warn!(worker_id = self.id(), "Worker thread is not accepting requests");
        on_end(Completion::Finished(Err(FarmError::Worker(
            "Worker thread is not running".into(),
        ))));
    }

    fn state(&self) -> WorkerState {
        lock(&self.shared.inner).state.clone()
    }

    fn stats(&self) -> WorkerStats {
        let inner = lock(&self.shared.inner);
        WorkerStats {
            id: self.id(),
            state: inner.state.clone(),
            jobs_completed: inner.jobs_completed,
            restarts: inner.restarts,
        }
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn end(&self, force_exit_delay: Duration) -> bool {
        let (unit, pending) = {
            let mut inner = lock(&self.shared.inner);
            if inner.state == WorkerState::Ended {
                return false;
            }
            inner.state = WorkerState::Ending;
            inner.generation += 1;
            (inner.unit.take(), inner.pending.take())
        };

        // A thread cannot be killed; one still busy after the delay is detached.
        let force_exited = match unit {
            Some(unit) => {
                let _ = unit.requests.send(ChildMessage::End);
                drop(unit.requests);
                match unit.done.recv_timeout(force_exit_delay) {
                    Err(RecvTimeoutError::Timeout) => true,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
                }
            }
            None => false,
        };

        lock(&self.shared.inner).state = WorkerState::Ended;
        debug!(worker_id = self.id(), force_exited, "Worker thread ended");

        if let Some(pending) = pending {
            (pending.on_end)(Completion::Finished(Err(FarmError::Ended)));
        }
        force_exited
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.end(DEFAULT_FORCE_EXIT_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForkOptions;
    use crate::module::{MethodTable, ModuleRegistry};
    use serde_json::{Value, json};

    fn options() -> WorkerOptions {
        let registry = ModuleRegistry::new().register("calc", || {
            MethodTable::new()
                .method("square", |args, _| {
                    let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!(n * n))
                })
                .method("tick", |_, ctx| {
                    ctx.message_parent(json!("tick"));
                    Ok(json!(ctx.worker_id()))
                })
                .method("explode", |_, _| panic!("explode called"))
        });
        let (output, _) = unbounded();
        WorkerOptions {
            id: 2,
            module: "calc".to_string(),
            setup_args: vec![],
            fork_options: ForkOptions::default(),
            idle_memory_limit_mib: None,
            registry,
            output,
        }
    }

    fn call(worker: &ThreadWorker, method: &str, args: Vec<Value>) -> (Completion, Vec<Value>) {
        let (tx, rx) = bounded(1);
        let custom = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&custom);
        worker.send(
            ChildMessage::call(method, args),
            Box::new(|_| {}),
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
            Arc::new(move |value| sink.lock().unwrap().push(value)),
        );
        let completion = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("completion delivered");
        let custom = custom.lock().unwrap().clone();
        (completion, custom)
    }

    #[test]
    fn test_thread_worker_call() {
        let worker = ThreadWorker::new(options()).unwrap();
        match call(&worker, "square", vec![json!(7)]) {
            (Completion::Finished(Ok(value)), _) => assert_eq!(value, json!(49)),
            other => panic!("Expected 49, got {:?}", other.0),
        }
        assert_eq!(worker.stats().jobs_completed, 1);
        assert_eq!(worker.pid(), None);
    }

    #[test]
    fn test_custom_messages_and_worker_id() {
        let worker = ThreadWorker::new(options()).unwrap();
        let (completion, custom) = call(&worker, "tick", vec![]);
        assert!(matches!(completion, Completion::Finished(Ok(ref v)) if *v == json!(3)));
        assert_eq!(custom, vec![json!("tick")]);
    }

    #[test]
    fn test_panic_is_lost_and_respawned() {
        let worker = ThreadWorker::new(options()).unwrap();
        match call(&worker, "explode", vec![]) {
            (Completion::Lost(TerminationReason::Panicked(msg)), _) => {
                assert!(msg.contains("explode called"))
            }
            other => panic!("Expected a lost call, got {:?}", other.0),
        }
        assert_eq!(worker.stats().restarts, 1);

        // The replacement thread serves the next call.
        assert!(matches!(
            call(&worker, "square", vec![json!(3)]).0,
            Completion::Finished(Ok(_))
        ));
    }

    #[test]
    fn test_end_settles_and_rejects() {
        let worker = ThreadWorker::new(options()).unwrap();
        assert!(!worker.end(Duration::from_millis(500)));
        assert_eq!(worker.state(), WorkerState::Ended);

        match call(&worker, "square", vec![json!(1)]).0 {
            Completion::Finished(Err(FarmError::Ended)) => {}
            other => panic!("Expected Ended, got {:?}", other),
        }
    }
}
