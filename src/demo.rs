//! Demonstration worker module.
//!
//! Hosted by the `workfarm` binary and used by its subcommands and by the
//! end-to-end tests. Every method is small and observable from the caller.

use crate::child::ENV_INTERNAL_WORKER;
use crate::error::ClientError;
use crate::module::{CallContext, ModuleRegistry, WorkerModule, unknown_method};
use serde_json::{Value, json};
use std::time::Duration;

/// Name the demo module is registered under.
pub const DEMO_MODULE: &str = "demo";

const MIB: usize = 1024 * 1024;

/// Registry containing the demo module.
pub fn registry() -> ModuleRegistry {
    ModuleRegistry::new().register(DEMO_MODULE, Demo::default)
}

#[derive(Default)]
pub struct Demo {
    /// Memory kept alive by `allocate_mib`
    retained: Vec<Vec<u8>>,
}

impl WorkerModule for Demo {
    fn setup(&mut self, args: &[Value]) -> Result<(), ClientError> {
        let fail = args
            .iter()
            .any(|arg| arg.get("fail_setup").and_then(Value::as_bool) == Some(true));
        if fail {
            return Err(ClientError::message("setup failed on request"));
        }
        Ok(())
    }

    fn call(
        &mut self,
        method: &str,
        args: Vec<Value>,
        ctx: &mut CallContext<'_>,
    ) -> Result<Value, ClientError> {
        match method {
            "echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
            "add" => add(&args),
            "worker_id" => Ok(json!(ctx.worker_id())),
            "pid" => Ok(json!(std::process::id())),
            "sleep_ms" => {
                let ms = u64_arg(&args, 0, "sleep_ms")?;
                std::thread::sleep(Duration::from_millis(ms));
                Ok(json!(ms))
            }
            "throws_error" => Err(throws_error(&args)),
            "progress" => {
                let steps = u64_arg(&args, 0, "progress")?;
                for step in 1..=steps {
                    ctx.message_parent(json!({ "step": step, "of": steps }));
                }
                Ok(json!(steps))
            }
            "crash" => crash(exit_code(&args)),
            "panic" => {
                let message = args.first().and_then(Value::as_str).unwrap_or("demo panic");
                panic!("{}", message)
            }
            "allocate_mib" => {
                let mib = u64_arg(&args, 0, "allocate_mib")? as usize;
                self.retained.push(vec![1u8; mib * MIB]);
                let total: usize = self.retained.iter().map(Vec::len).sum();
                Ok(json!(total / MIB))
            }
            "log" => {
                for arg in &args {
                    match arg {
                        Value::String(s) => println!("{}", s),
                        other => println!("{}", other),
                    }
                }
                Ok(Value::Null)
            }
            other => Err(unknown_method(other)),
        }
    }
}

fn u64_arg(args: &[Value], index: usize, method: &str) -> Result<u64, ClientError> {
    args.get(index).and_then(Value::as_u64).ok_or_else(|| {
        ClientError::new(
            "TypeError",
            format!("{} expects a non-negative integer argument", method),
        )
    })
}

/// Sum numbers, staying integral when every argument is an integer.
fn add(args: &[Value]) -> Result<Value, ClientError> {
    if let Some(ints) = args.iter().map(Value::as_i64).collect::<Option<Vec<i64>>>() {
        return Ok(json!(ints.iter().sum::<i64>()));
    }
    let floats = args
        .iter()
        .map(Value::as_f64)
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| ClientError::new("TypeError", "add expects numbers"))?;
    Ok(json!(floats.iter().sum::<f64>()))
}

/// `throws_error(name, message, [extra])`
fn throws_error(args: &[Value]) -> ClientError {
    let name = args.first().and_then(Value::as_str).unwrap_or("Error");
    let message = args.get(1).and_then(Value::as_str).unwrap_or("");
    let mut err = ClientError::new(name, message)
        .with_stack(format!("{}: {}\n    at demo.throws_error", name, message));
    if let Some(Value::Object(extra)) = args.get(2) {
        for (key, value) in extra {
            err = err.with_extra(key.clone(), value.clone());
        }
    }
    err
}

/// Exit the worker process. In a thread worker this panics instead, since
/// exiting would take the whole host down.
/// Exit code requested by `crash`; 1 when absent or out of range.
fn exit_code(args: &[Value]) -> i32 {
    args.first()
        .and_then(Value::as_i64)
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(1)
}

fn crash(code: i32) -> ! {
    if std::env::var(ENV_INTERNAL_WORKER).as_deref() == Ok("1") {
        std::process::exit(code);
    }
    panic!("crash requested with exit code {}", code)
}
