//! Process-backed worker.
//!
//! Each worker owns one child process at a time plus a collector thread that
//! reads the child's responses. A collector is tied to the generation of the
//! process it was spawned for; once the worker has moved on to a newer
//! process, anything an old collector observes is ignored.

use super::ipc::FrameReader;
use super::proc::Proc;
use super::protocol::{ChildMessage, ParentMessage};
use super::signals::TerminationReason;
use super::spawn::{SpawnedWorker, forward_output, spawn_named_thread, spawn_worker};
use super::{
    Completion, Delivery, OnCustomMessage, OnEnd, OnStart, OutputStream, Pending, WorkerId,
    WorkerInterface, WorkerOptions, WorkerState, WorkerStats, lock, route,
};
use crate::config::DEFAULT_FORCE_EXIT_DELAY;
use crate::error::{FarmError, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long to wait for a process to exit after its response pipe closed.
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// A worker whose execution unit is a child process.
pub struct ProcessWorker {
    shared: Arc<Shared>,
}

struct Shared {
    options: WorkerOptions,
    inner: Mutex<Inner>,
}

struct Inner {
    state: WorkerState,
    proc: Option<Proc>,
    pending: Option<Pending>,
    /// Bumped every time the process is replaced or taken away
    generation: u64,
    jobs_completed: u64,
    restarts: u64,
}

impl ProcessWorker {
    /// Spawn the worker process and send it `INITIALIZE`.
    pub fn new(options: WorkerOptions) -> Result<Self> {
        let shared = Arc::new(Shared {
            options,
            inner: Mutex::new(Inner {
                state: WorkerState::Spawning,
                proc: None,
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

    /// Start a new process and its collector. The caller holds the lock.
    ///
    /// On failure the worker is left without a process in the `Exited` state,
    /// so the next send tries again.
    fn spawn_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        inner.state = WorkerState::Spawning;
        inner.generation += 1;
        let generation = inner.generation;

        match self.start_process(generation) {
            Ok(proc) => {
                inner.proc = Some(proc);
                inner.state = WorkerState::Ready;
                Ok(())
            }
            Err(e) => {
                inner.state = WorkerState::Exited;
                Err(e)
            }
        }
    }

    fn start_process(self: &Arc<Self>, generation: u64) -> Result<Proc> {
        let SpawnedWorker {
            mut proc,
            responses,
            stdout,
            stderr,
        } = spawn_worker(&self.options)?;

        let id = self.id();
        forward_output(id, OutputStream::Stdout, stdout, self.options.output.clone())?;
        forward_output(id, OutputStream::Stderr, stderr, self.options.output.clone())?;

        proc.send(&self.options.initialize_message())?;

        let shared = Arc::clone(self);
        spawn_named_thread(format!("workfarm-collector-{}", id), move || {
            shared.collect(generation, responses)
        })?;

        Ok(proc)
    }

    /// Replace the process after it went away, counting a restart on success.
    fn respawn_locked(self: &Arc<Self>, inner: &mut Inner) -> Result<()> {
        self.spawn_locked(inner)?;
        inner.restarts += 1;
        debug!(worker_id = self.id(), restarts = inner.restarts, "Worker respawned");
        Ok(())
    }

    /// Collector loop: one per process generation.
    fn collect(self: Arc<Self>, generation: u64, mut responses: FrameReader) {
        loop {
            let message = match responses.read_frame() {
                Ok(Some(line)) => ParentMessage::from_line(line),
                Ok(None) => break,
                Err(e) => {
                    warn!(worker_id = self.id(), error = %e, "Failed to read worker response");
                    break;
                }
            };

            match message {
                Ok(message) => self.on_message(generation, message),
                Err(e) => {
                    self.on_protocol_violation(generation, e);
                    return;
                }
            }
        }

        self.on_exit(generation);
    }

    fn on_message(self: &Arc<Self>, generation: u64, message: ParentMessage) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return;
        }

        let delivery = route(&mut inner.pending, message);
        if let Delivery::Settle(..) = delivery {
            inner.jobs_completed += 1;
            inner.state = WorkerState::Ready;
            self.recycle_if_over_limit(&mut inner);
        }
        drop(inner);

        delivery.deliver(self.id());
    }

    /// Gracefully restart an idle process whose RSS exceeds the configured limit.
    fn recycle_if_over_limit(self: &Arc<Self>, inner: &mut Inner) {
        let Some(limit) = self.options.idle_memory_limit_mib else {
            return;
        };
        let Some(rss) = inner.proc.as_ref().and_then(Proc::rss_mib) else {
            return;
        };
        if rss <= limit {
            return;
        }

        info!(
            worker_id = self.id(),
            rss_mib = rss,
            limit_mib = limit,
            "Worker over idle memory limit, recycling"
        );

        inner.generation += 1;
        if let Some(mut proc) = inner.proc.take()
            && let Err(e) = proc.stop(DEFAULT_FORCE_EXIT_DELAY)
        {
            warn!(worker_id = self.id(), error = %e, "Failed to stop worker for recycling");
        }
        if let Err(e) = self.respawn_locked(inner) {
            error!(worker_id = self.id(), error = %e, "Failed to respawn recycled worker");
        }
    }

    fn on_protocol_violation(self: &Arc<Self>, generation: u64, err: FarmError) {
        let detail = match err {
            FarmError::Protocol(detail) => detail,
            other => other.to_string(),
        };

        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return;
        }

        error!(
            worker_id = self.id(),
            error = %detail,
            "Worker sent an invalid response, killing it"
        );

        let pending = inner.pending.take();
        if let Some(mut proc) = inner.proc.take()
            && let Err(e) = proc.kill()
        {
            warn!(worker_id = self.id(), error = %e, "Failed to kill worker");
        }
        inner.state = WorkerState::Crashed(TerminationReason::ProtocolViolation(detail.clone()));
        if let Err(e) = self.respawn_locked(&mut inner) {
            error!(worker_id = self.id(), error = %e, "Failed to respawn worker");
        }
        drop(inner);

        if let Some(pending) = pending {
            (pending.on_end)(Completion::Finished(Err(FarmError::Protocol(detail))));
        }
    }

    /// The response pipe closed: the process is gone or going.
    fn on_exit(self: &Arc<Self>, generation: u64) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            return;
        }
        let Some(mut proc) = inner.proc.take() else {
            return;
        };

        let pid = proc.pid().as_raw();
        let reason = reap_after_eof(&mut proc);
        let pending = inner.pending.take();

        if reason.is_crash() {
            warn!(
                worker_id = self.id(),
                pid,
                reason = %reason,
                lost_call = pending.is_some(),
                "Worker crashed, respawning"
            );
            inner.state = WorkerState::Crashed(reason.clone());
            if let Err(e) = self.respawn_locked(&mut inner) {
                error!(worker_id = self.id(), error = %e, "Failed to respawn worker");
                inner.state = WorkerState::Crashed(reason.clone());
            }
        } else {
            debug!(worker_id = self.id(), pid, "Worker exited");
            inner.state = WorkerState::Exited;
        }
        drop(inner);

        if let Some(pending) = pending {
            (pending.on_end)(Completion::Lost(reason));
        }
    }
}

/// Reap a process whose response pipe closed, killing it if it lingers.
fn reap_after_eof(proc: &mut Proc) -> TerminationReason {
    let start = Instant::now();
    while start.elapsed() < EXIT_GRACE {
        match proc.try_wait() {
            Ok(Some(reason)) => return reason,
            Ok(None) => std::thread::sleep(Duration::from_millis(5)),
            Err(_) => return TerminationReason::Unknown,
        }
    }
    proc.kill().unwrap_or(TerminationReason::Unknown)
}

impl WorkerInterface for ProcessWorker {
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

        if inner.proc.is_none()
            && let Err(e) = self.shared.respawn_locked(&mut inner)
        {
            drop(inner);
            on_end(Completion::Finished(Err(e)));
            return;
        }

        inner.pending = Some(Pending {
            on_end,
            on_custom_message,
        });
        inner.state = WorkerState::Busy;

        let Err(first) = write_request(&mut inner, &request) else {
            return;
        };

        // The process may have died between calls; if so, respawn and retry once.
        let exited = match inner.proc.as_mut().map(Proc::try_wait) {
            Some(Ok(Some(reason))) => {
                debug!(worker_id = self.id(), reason = %reason, "Worker died before send");
                true
            }
            _ => false,
        };

        let result = if exited {
            inner.proc = None;
            self.shared
                .respawn_locked(&mut inner)
                .and_then(|()| write_request(&mut inner, &request))
        } else {
            Err(first)
        };

        if let Err(e) = result {
            warn!(worker_id = self.id(), error = %e, "Failed to send request to worker");
            let pending = inner.pending.take();
            if inner.proc.is_some() {
                inner.state = WorkerState::Ready;
            }
            drop(inner);
            if let Some(pending) = pending {
                (pending.on_end)(Completion::Finished(Err(e)));
            }
        }
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
        let inner = lock(&self.shared.inner);
        inner.proc.as_ref().map(|p| p.pid().as_raw() as u32)
    }

    fn end(&self, force_exit_delay: Duration) -> bool {
        let (proc, pending) = {
            let mut inner = lock(&self.shared.inner);
            if inner.state == WorkerState::Ended {
                return false;
            }
            inner.state = WorkerState::Ending;
            inner.generation += 1;
            (inner.proc.take(), inner.pending.take())
        };

        let force_exited = match proc {
            Some(mut proc) => proc.stop(force_exit_delay).unwrap_or_else(|e| {
                warn!(worker_id = self.id(), error = %e, "Failed to stop worker");
                true
            }),
            None => false,
        };

        lock(&self.shared.inner).state = WorkerState::Ended;
        debug!(worker_id = self.id(), force_exited, "Worker ended");

        if let Some(pending) = pending {
            (pending.on_end)(Completion::Finished(Err(FarmError::Ended)));
        }
        force_exited
    }
}

fn write_request(inner: &mut Inner, request: &ChildMessage) -> Result<()> {
    match inner.proc.as_mut() {
        Some(proc) => proc.send(request),
        None => Err(FarmError::Worker("Worker process is not running".into())),
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.end(DEFAULT_FORCE_EXIT_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForkOptions;
    use crate::module::ModuleRegistry;
    use crossbeam_channel::{bounded, unbounded};
    use serde_json::json;

    /// A shell stand-in for a worker binary: answers every request with `[0, "pong"]`.
    fn shell_options(script: &str) -> WorkerOptions {
        let (output, _) = unbounded();
        WorkerOptions {
            id: 0,
            module: "shell".to_string(),
            setup_args: vec![],
            fork_options: ForkOptions::program("sh")
                .with_arg("-c")
                .with_arg(script),
            idle_memory_limit_mib: None,
            registry: ModuleRegistry::new(),
            output,
        }
    }

    fn call(worker: &ProcessWorker) -> Completion {
        let (tx, rx) = bounded(1);
        worker.send(
            ChildMessage::call("ping", vec![]),
            Box::new(|_| {}),
            Box::new(move |completion| {
                let _ = tx.send(completion);
            }),
            Arc::new(|_| {}),
        );
        rx.recv_timeout(Duration::from_secs(10))
            .expect("completion delivered")
    }

    #[test]
    fn test_process_worker_roundtrip() {
        let worker = ProcessWorker::new(shell_options(
            r#"while read line; do echo '[0, "pong"]' >&3; done"#,
        ))
        .unwrap();

        match call(&worker) {
            Completion::Finished(Ok(value)) => assert_eq!(value, json!("pong")),
            other => panic!("Expected pong, got {:?}", other),
        }
        assert_eq!(worker.stats().jobs_completed, 1);
        assert!(worker.pid().is_some());
        worker.end(Duration::from_millis(100));
        assert_eq!(worker.state(), WorkerState::Ended);
    }

    #[test]
    fn test_invalid_response_is_protocol_error() {
        let worker = ProcessWorker::new(shell_options(
            r#"while read line; do echo '[9, 1]' >&3; done"#,
        ))
        .unwrap();

        match call(&worker) {
            Completion::Finished(Err(FarmError::Protocol(detail))) => {
                assert!(detail.contains("Unexpected response from worker: 9"))
            }
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_crash_mid_call_is_lost_and_respawned() {
        // Skip INITIALIZE, then die on the first call.
        let worker =
            ProcessWorker::new(shell_options("read init; read call; exit 3")).unwrap();

        match call(&worker) {
            Completion::Lost(reason) => assert_eq!(reason, TerminationReason::Exited(3)),
            other => panic!("Expected lost call, got {:?}", other),
        }
        assert_eq!(worker.stats().restarts, 1);
    }

    /// Whether `pid` has exited but not been reaped yet.
    #[cfg(target_os = "linux")]
    fn is_zombie(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                let (_, rest) = stat.rsplit_once(')')?;
                rest.split_whitespace().next().map(|state| state == "Z")
            })
            .unwrap_or(false)
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_idle_exit_detected_on_write_resends_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let calls = dir.path().join("calls");

        // First process: take INITIALIZE and exit cleanly, leaving a background
        // sleeper holding fd 3 so the collector does not see EOF yet.
        // Later processes answer every call and record it.
        let script = format!(
            r#"if [ -e '{marker}' ]; then
                 read init
                 while read line; do echo call >> '{calls}'; echo '[0, "pong"]' >&3; done
               else
                 touch '{marker}'; read init; sleep 5 </dev/null & exit 0
               fi"#,
            marker = marker.display(),
            calls = calls.display(),
        );
        let worker = ProcessWorker::new(shell_options(&script)).unwrap();

        let pid = worker.pid().expect("first process running");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !is_zombie(pid) {
            assert!(Instant::now() < deadline, "first process never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(worker.stats().restarts, 0, "exit noticed before the send");

        match call(&worker) {
            Completion::Finished(Ok(value)) => assert_eq!(value, json!("pong")),
            other => panic!("Expected pong after resend, got {:?}", other),
        }
        assert_eq!(worker.stats().restarts, 1);
        assert_ne!(worker.pid(), Some(pid));

        let executions = std::fs::read_to_string(&calls).unwrap();
        assert_eq!(executions.lines().count(), 1);
        worker.end(Duration::from_millis(100));
    }
}
