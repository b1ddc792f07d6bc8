//! End-to-end tests of the library API against real worker processes.
//!
//! Process workers are copies of the `workfarm` binary, which hosts the demo module.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use workfarm::{
    ExecutionKind, FarmError, FarmOptions, ForkOptions, OutputStream, SchedulingPolicy,
    WorkHandle, WorkerFarm, demo,
};

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

fn process_options(workers: usize) -> FarmOptions {
    FarmOptions::new(demo::DEMO_MODULE)
        .with_workers(workers)
        .with_execution(ExecutionKind::Process)
        .with_fork_options(ForkOptions::program(env!("CARGO_BIN_EXE_workfarm")))
}

fn thread_options(workers: usize) -> FarmOptions {
    FarmOptions::new(demo::DEMO_MODULE)
        .with_workers(workers)
        .with_execution(ExecutionKind::Thread)
        .with_registry(demo::registry())
}

fn result(handle: &WorkHandle) -> workfarm::Result<Value> {
    handle
        .wait_timeout(CALL_TIMEOUT)
        .unwrap_or_else(|| panic!("'{}' did not settle in time", handle.method()))
}

/// Poll `condition` until it holds or the timeout expires.
fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + CALL_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_echo_roundtrip() {
    let farm = WorkerFarm::new(process_options(2)).unwrap();
    assert_eq!(farm.kind(), ExecutionKind::Process);

    let handle = farm.call("echo", vec![json!({"nested": [1, 2, 3]})]);
    assert_eq!(result(&handle).unwrap(), json!({"nested": [1, 2, 3]}));
    assert_eq!(farm.call("add", vec![json!(40), json!(2)]).wait().unwrap(), json!(42));
}

#[test]
fn test_client_error_keeps_name_message_and_extra() {
    let farm = WorkerFarm::new(process_options(1)).unwrap();
    let handle = farm.call(
        "throws_error",
        vec![json!("RangeError"), json!("oops"), json!({"code": "E_RANGE"})],
    );

    match result(&handle) {
        Err(FarmError::Client(err)) => {
            assert_eq!(err.name, "RangeError");
            assert_eq!(err.message, "oops");
            assert_eq!(err.extra.get("code"), Some(&json!("E_RANGE")));
            assert!(err.stack.unwrap().contains("RangeError: oops"));
        }
        other => panic!("Expected client error, got {:?}", other),
    }
}

#[test]
fn test_unknown_method_is_type_error() {
    let farm = WorkerFarm::new(process_options(1)).unwrap();
    match result(&farm.call("does_not_exist", vec![])) {
        Err(FarmError::Client(err)) => {
            assert_eq!(err.name, "TypeError");
            assert!(err.message.contains("does_not_exist"));
        }
        other => panic!("Expected TypeError, got {:?}", other),
    }
}

#[test]
fn test_setup_error_rejects_every_call() {
    let options = process_options(1).with_setup_args(vec![json!({"fail_setup": true})]);
    let farm = WorkerFarm::new(options).unwrap();

    for _ in 0..2 {
        match result(&farm.call("echo", vec![json!(1)])) {
            Err(FarmError::Setup(err)) => assert!(err.message.contains("setup failed on request")),
            other => panic!("Expected setup error, got {:?}", other),
        }
    }
}

#[test]
fn test_unknown_module_is_setup_error() {
    let options = FarmOptions::new("missing")
        .with_workers(1)
        .with_execution(ExecutionKind::Process)
        .with_fork_options(ForkOptions::program(env!("CARGO_BIN_EXE_workfarm")));
    let farm = WorkerFarm::new(options).unwrap();

    match result(&farm.call("echo", vec![])) {
        Err(FarmError::Setup(err)) => assert!(err.message.contains("missing")),
        other => panic!("Expected setup error, got {:?}", other),
    }
}

#[test]
fn test_custom_messages_reach_listener() {
    let farm = WorkerFarm::new(process_options(1)).unwrap();

    // Keep the only worker busy so the listener is attached before dispatch.
    let busy = farm.call("sleep_ms", vec![json!(200)]);
    let handle = farm.call("progress", vec![json!(4)]);
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _subscription = handle.on_custom_message(move |payload| {
        sink.lock().unwrap().push(payload.clone());
    });

    assert_eq!(result(&busy).unwrap(), json!(200));
    assert_eq!(result(&handle).unwrap(), json!(4));
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 4);
    assert_eq!(received[0], json!({"step": 1, "of": 4}));
    assert_eq!(received[3], json!({"step": 4, "of": 4}));
}

#[test]
fn test_killed_worker_is_respawned() {
    let farm = WorkerFarm::new(process_options(1)).unwrap();
    let first = result(&farm.call("pid", vec![])).unwrap().as_u64().unwrap();
    assert_eq!(farm.worker_pids(), vec![Some(first as u32)]);

    kill(Pid::from_raw(first as i32), Signal::SIGKILL).unwrap();
    assert!(eventually(|| farm.stats().pool.total_restarts >= 1));

    let second = result(&farm.call("pid", vec![])).unwrap().as_u64().unwrap();
    assert_ne!(first, second);
}

#[test]
fn test_crash_mid_call_is_parked_until_end() {
    let farm = WorkerFarm::new(process_options(1)).unwrap();
    let lost = farm.call("crash", vec![json!(3)]);

    assert!(eventually(|| farm.stats().lost_tasks == 1));
    assert!(lost.try_result().is_none());

    // The replacement worker serves new calls.
    assert_eq!(result(&farm.call("echo", vec![json!("after")])).unwrap(), json!("after"));
    assert_eq!(farm.stats().pool.total_restarts, 1);

    farm.end().unwrap();
    assert!(matches!(lost.wait(), Err(FarmError::Ended)));
}

#[test]
fn test_sticky_keys_pin_to_one_worker() {
    let options = process_options(2).with_worker_key(|_, args| {
        args.first().and_then(Value::as_str).map(String::from)
    });
    let farm = WorkerFarm::new(options).unwrap();

    let x1 = farm.call("worker_id", vec![json!("x")]);
    let y = farm.call("worker_id", vec![json!("y")]);
    let x2 = farm.call("worker_id", vec![json!("x")]);

    let x1 = result(&x1).unwrap();
    assert_eq!(result(&x2).unwrap(), x1);
    let y = result(&y).unwrap();
    assert!(y == json!(1) || y == json!(2));
}

#[test]
fn test_in_order_policy_prefers_first_worker() {
    let options = process_options(3).with_scheduling_policy(SchedulingPolicy::InOrder);
    let farm = WorkerFarm::new(options).unwrap();
    for _ in 0..3 {
        assert_eq!(result(&farm.call("worker_id", vec![])).unwrap(), json!(1));
    }
}

#[test]
fn test_worker_ids_are_one_based() {
    let farm = WorkerFarm::new(process_options(3)).unwrap();
    let handles: Vec<_> = (0..3)
        .map(|_| farm.call("sleep_ms", vec![json!(100)]))
        .collect();
    let ids: Vec<_> = (0..3).map(|_| farm.call("worker_id", vec![])).collect();
    for handle in &handles {
        result(handle).unwrap();
    }
    for id in &ids {
        let id = result(id).unwrap().as_u64().unwrap();
        assert!((1..=3).contains(&id));
    }
}

#[test]
fn test_worker_stdout_is_forwarded() {
    let farm = WorkerFarm::new(process_options(1)).unwrap();
    let output = farm.output();

    result(&farm.call("log", vec![json!("hello from the worker")])).unwrap();

    let deadline = Instant::now() + CALL_TIMEOUT;
    let line = loop {
        let line = output
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .expect("no output line from worker");
        if line.stream == OutputStream::Stdout {
            break line;
        }
    };
    assert_eq!(line.worker_id, 0);
    assert_eq!(line.line, "hello from the worker");
}

#[test]
fn test_end_forces_busy_workers() {
    let options = process_options(1).with_force_exit_delay(Duration::from_millis(100));
    let farm = WorkerFarm::new(options).unwrap();

    let busy = farm.call("sleep_ms", vec![json!(10_000)]);
    let queued = farm.call("echo", vec![json!(1)]);
    assert!(eventually(|| farm.stats().queued == 1));

    let end = farm.end().unwrap();
    assert!(end.force_exited);
    assert!(matches!(result(&busy), Err(FarmError::Ended)));
    assert!(matches!(result(&queued), Err(FarmError::Ended)));

    assert!(matches!(farm.end(), Err(FarmError::Ended)));
    assert!(matches!(farm.call("echo", vec![]).wait(), Err(FarmError::Ended)));
}

#[test]
fn test_idle_workers_end_gracefully() {
    let farm = WorkerFarm::new(process_options(2)).unwrap();
    result(&farm.call("echo", vec![json!(1)])).unwrap();
    let end = farm.end().unwrap();
    assert!(!end.force_exited);
}

#[cfg(target_os = "linux")]
#[test]
fn test_idle_memory_limit_recycles_worker() {
    let options = process_options(1).with_idle_memory_limit(32);
    let farm = WorkerFarm::new(options).unwrap();

    let before = result(&farm.call("pid", vec![])).unwrap();
    assert_eq!(result(&farm.call("allocate_mib", vec![json!(64)])).unwrap(), json!(64));
    let after = result(&farm.call("pid", vec![])).unwrap();

    assert_ne!(before, after);
    assert_eq!(farm.stats().pool.total_restarts, 1);
}

#[test]
fn test_thread_workers() {
    let farm = WorkerFarm::new(thread_options(2)).unwrap();
    assert_eq!(farm.kind(), ExecutionKind::Thread);
    assert_eq!(farm.worker_pids(), vec![None, None]);

    assert_eq!(result(&farm.call("add", vec![json!(1), json!(2)])).unwrap(), json!(3));
    match result(&farm.call("throws_error", vec![json!("TypeError"), json!("bad")])) {
        Err(FarmError::Client(err)) => assert_eq!(err.name, "TypeError"),
        other => panic!("Expected client error, got {:?}", other),
    }
}

#[test]
fn test_thread_worker_panic_is_respawned() {
    let farm = WorkerFarm::new(thread_options(1)).unwrap();
    let lost = farm.call("panic", vec![json!("boom")]);

    assert!(eventually(|| farm.stats().lost_tasks == 1));
    assert_eq!(result(&farm.call("echo", vec![json!(7)])).unwrap(), json!(7));
    assert_eq!(farm.stats().pool.total_restarts, 1);

    farm.end().unwrap();
    assert!(matches!(lost.wait(), Err(FarmError::Ended)));
}

#[test]
fn test_zero_workers_rejected() {
    assert!(matches!(
        WorkerFarm::new(process_options(0)),
        Err(FarmError::Config(_))
    ));
}
