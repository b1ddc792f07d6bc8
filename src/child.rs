//! Worker-side runtime.
//!
//! [`ChildRuntime`] turns scheduler messages into module calls and parent
//! messages. Process workers drive it from [`run_worker_main`] over pipes;
//! thread workers drive it over channels.
//!
//! A binary that wants to host process workers calls [`run_if_worker`] first
//! thing in `main`. When the process was spawned as a worker it never returns.

use crate::error::{ClientError, SetupError};
use crate::logging::{self, LogConfig};
use crate::module::{CallContext, ModuleRegistry, WorkerModule};
use crate::worker::ipc::{CHILD_RESPONSE_FD, FrameReader, FrameWriter, PipeFd};
use crate::worker::protocol::{ChildMessage, ParentMessage};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

/// Marks a process spawned as a worker.
pub const ENV_INTERNAL_WORKER: &str = "WORKFARM_INTERNAL_WORKER";
/// 1-based worker ordinal.
pub const ENV_WORKER_ID: &str = "WORKFARM_WORKER_ID";
/// File descriptor carrying worker responses.
pub const ENV_IPC_FD: &str = "WORKFARM_IPC_FD";

/// Set once the host binary has installed the worker entry point.
static WORKER_ENTRY_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Whether this executable can be re-executed as a process worker.
pub fn worker_entry_installed() -> bool {
    WORKER_ENTRY_INSTALLED.load(Ordering::Relaxed)
}

/// Whether the loop should keep reading messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Module host inside one execution unit.
pub struct ChildRuntime {
    registry: ModuleRegistry,
    worker_id: usize,
    module_name: Option<String>,
    setup_args: Vec<Value>,
    module: Option<Box<dyn WorkerModule>>,
    initialized: bool,
}

impl ChildRuntime {
    pub fn new(registry: ModuleRegistry, worker_id: usize) -> Self {
        Self {
            registry,
            worker_id,
            module_name: None,
            setup_args: Vec::new(),
            module: None,
            initialized: false,
        }
    }

    /// Handle one scheduler message, emitting parent messages through `out`.
    ///
    /// Every `CALL` produces exactly one terminal message, preceded by any
    /// number of `CUSTOM` messages.
    pub fn handle(&mut self, message: ChildMessage, out: &mut dyn FnMut(ParentMessage)) -> Flow {
        match message {
            ChildMessage::Initialize { module, setup_args } => {
                self.module_name = Some(module);
                self.setup_args = setup_args;
                self.module = None;
                self.initialized = false;
                Flow::Continue
            }
            ChildMessage::Call { method, args, .. } => {
                let response = self.call(&method, args, out);
                out(response);
                Flow::Continue
            }
            ChildMessage::End => Flow::Exit,
        }
    }

    fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        out: &mut dyn FnMut(ParentMessage),
    ) -> ParentMessage {
        if let Err(err) = self.ensure_setup() {
            return ParentMessage::SetupError(err);
        }
        let Some(module) = self.module.as_mut() else {
            return ParentMessage::SetupError(setup_error("Worker module is not loaded"));
        };

        let mut emit = |payload: Value| out(ParentMessage::Custom(payload));
        let mut ctx = CallContext::new(self.worker_id, &mut emit);
        match module.call(method, args, &mut ctx) {
            Ok(result) => ParentMessage::Ok(result),
            Err(err) => ParentMessage::ClientError(err),
        }
    }

    /// Load and set up the module on first use. Failed setup is retried.
    fn ensure_setup(&mut self) -> Result<(), SetupError> {
        if self.initialized {
            return Ok(());
        }

        let Some(name) = self.module_name.as_deref() else {
            return Err(setup_error("Worker has not been initialized"));
        };

        if self.module.is_none() {
            self.module = self.registry.load(name);
        }
        let Some(module) = self.module.as_mut() else {
            return Err(setup_error(&format!("Cannot find module '{}'", name)));
        };

        module.setup(&self.setup_args).map_err(|err: ClientError| SetupError {
            name: err.name,
            message: err.message,
            stack: err.stack,
        })?;
        self.initialized = true;
        Ok(())
    }
}

fn setup_error(message: &str) -> SetupError {
    SetupError {
        name: "Error".to_string(),
        message: message.to_string(),
        stack: None,
    }
}

/// Run the worker loop if this process was spawned as a worker.
///
/// Must be called before anything else touches stdin/stdout. In a parent
/// process it only records that the entry point exists and returns.
pub fn run_if_worker(registry: &ModuleRegistry) {
    WORKER_ENTRY_INSTALLED.store(true, Ordering::Relaxed);
    if std::env::var(ENV_INTERNAL_WORKER).as_deref() == Ok("1") {
        run_worker_main(registry.clone());
    }
}

/// Worker main loop over pipes.
fn worker_loop(
    runtime: &mut ChildRuntime,
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
) -> io::Result<()> {
    loop {
        let message = match reader.read_frame()? {
            Some(line) => ChildMessage::from_line(line),
            // Parent closed the pipe
            None => return Ok(()),
        };

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                // Keep one response per request so the parent stays in step.
                let err = ClientError::new("ProtocolError", format!("Invalid request: {}", e));
                writer.write_frame(&ParentMessage::ClientError(err).to_line())?;
                continue;
            }
        };

        let mut write_result = Ok(());
        let flow = runtime.handle(message, &mut |response| {
            if write_result.is_ok() {
                write_result = writer.write_frame(&response.to_line());
            }
        });
        write_result?;

        if flow == Flow::Exit {
            return Ok(());
        }
    }
}

/// Run the worker subprocess main function.
///
/// Never returns: exits 0 on `END` or when the parent goes away, 1 on I/O failure.
pub fn run_worker_main(registry: ModuleRegistry) -> ! {
    // Ignore SIGPIPE - pipe errors surface as io::Error
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    logging::init(LogConfig::for_worker().with_env_overrides());

    let worker_id = std::env::var(ENV_WORKER_ID)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let response_fd = std::env::var(ENV_IPC_FD)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(CHILD_RESPONSE_FD);

    // Safety: fd 0 is stdin and the response fd was installed by the parent before exec.
    let mut reader = FrameReader::new(unsafe { PipeFd::from_raw(0) });
    let mut writer = FrameWriter::new(unsafe { PipeFd::from_raw(response_fd) });

    tracing::debug!(worker_id, pid = std::process::id(), "Worker process started");

    let mut runtime = ChildRuntime::new(registry, worker_id);
    match worker_loop(&mut runtime, &mut reader, &mut writer) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!(worker_id, error = %e, "Worker I/O failed");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::MethodTable;
    use serde_json::json;

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new().register("calc", || {
            MethodTable::new()
                .on_setup(|args| match args.first() {
                    Some(Value::String(s)) if s == "broken" => {
                        Err(ClientError::message("cannot set up"))
                    }
                    _ => Ok(()),
                })
                .method("add", |args, _| {
                    let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                    Ok(json!(sum))
                })
                .method("progress", |args, ctx| {
                    let steps = args.first().and_then(Value::as_u64).unwrap_or(0);
                    for step in 1..=steps {
                        ctx.message_parent(json!(step));
                    }
                    Ok(json!(ctx.worker_id()))
                })
        })
    }

    fn run(runtime: &mut ChildRuntime, message: ChildMessage) -> (Flow, Vec<ParentMessage>) {
        let mut out = Vec::new();
        let flow = runtime.handle(message, &mut |m| out.push(m));
        (flow, out)
    }

    #[test]
    fn test_call_after_initialize() {
        let mut runtime = ChildRuntime::new(registry(), 1);
        let (flow, out) = run(&mut runtime, ChildMessage::initialize("calc", vec![]));
        assert_eq!(flow, Flow::Continue);
        assert!(out.is_empty(), "initialize is not acknowledged");

        let (_, out) = run(&mut runtime, ChildMessage::call("add", vec![json!(2), json!(3)]));
        assert_eq!(out, vec![ParentMessage::Ok(json!(5))]);
    }

    #[test]
    fn test_custom_messages_precede_result() {
        let mut runtime = ChildRuntime::new(registry(), 4);
        run(&mut runtime, ChildMessage::initialize("calc", vec![]));

        let (_, out) = run(&mut runtime, ChildMessage::call("progress", vec![json!(2)]));
        assert_eq!(
            out,
            vec![
                ParentMessage::Custom(json!(1)),
                ParentMessage::Custom(json!(2)),
                ParentMessage::Ok(json!(4)),
            ]
        );
    }

    #[test]
    fn test_unknown_module_is_setup_error() {
        let mut runtime = ChildRuntime::new(registry(), 1);
        run(&mut runtime, ChildMessage::initialize("nope", vec![]));

        let (_, out) = run(&mut runtime, ChildMessage::call("add", vec![]));
        match &out[..] {
            [ParentMessage::SetupError(err)] => {
                assert!(err.message.contains("Cannot find module 'nope'"))
            }
            other => panic!("Expected a single SetupError, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_setup_reported_on_every_call() {
        let mut runtime = ChildRuntime::new(registry(), 1);
        run(&mut runtime, ChildMessage::initialize("calc", vec![json!("broken")]));

        for _ in 0..2 {
            let (_, out) = run(&mut runtime, ChildMessage::call("add", vec![]));
            assert!(matches!(&out[..], [ParentMessage::SetupError(e)] if e.message == "cannot set up"));
        }
    }

    #[test]
    fn test_unknown_method_is_client_error() {
        let mut runtime = ChildRuntime::new(registry(), 1);
        run(&mut runtime, ChildMessage::initialize("calc", vec![]));

        let (_, out) = run(&mut runtime, ChildMessage::call("divide", vec![]));
        match &out[..] {
            [ParentMessage::ClientError(err)] => assert_eq!(err.name, "TypeError"),
            other => panic!("Expected a single ClientError, got {:?}", other),
        }
    }

    #[test]
    fn test_call_before_initialize() {
        let mut runtime = ChildRuntime::new(registry(), 1);
        let (_, out) = run(&mut runtime, ChildMessage::call("add", vec![]));
        assert!(matches!(&out[..], [ParentMessage::SetupError(_)]));
    }

    #[test]
    fn test_end_exits() {
        let mut runtime = ChildRuntime::new(registry(), 1);
        let (flow, out) = run(&mut runtime, ChildMessage::End);
        assert_eq!(flow, Flow::Exit);
        assert!(out.is_empty());
    }
}
