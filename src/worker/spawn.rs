//! Worker subprocess spawning.
//!
//! Uses `std::process::Command` with a `pre_exec` hook that installs the
//! response pipe at fd 3. The child's stdout and stderr are piped so the
//! parent can forward them, tagged, to the pool's output channel.

use super::ipc::{self, CHILD_RESPONSE_FD, FrameReader};
use super::proc::Proc;
use super::{OutputLine, OutputStream, WorkerId, WorkerOptions};
use crate::child::{ENV_INTERNAL_WORKER, ENV_IPC_FD, ENV_WORKER_ID};
use crate::error::{FarmError, Result};
use crossbeam_channel::Sender;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

/// Stack size for collector and worker threads (8 MiB).
///
/// Module code in thread workers runs on these stacks.
pub const WORKER_THREAD_STACK_SIZE: usize = 8 * 1024 * 1024;

/// A freshly spawned worker process and the parent's ends of its pipes.
pub struct SpawnedWorker {
    pub proc: Proc,
    /// Responses written by the child to fd 3
    pub responses: FrameReader,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn a worker subprocess in worker mode.
///
/// The program is `fork_options.program`, or the current executable. The
/// child sees `WORKFARM_INTERNAL_WORKER=1` and its 1-based ordinal.
pub fn spawn_worker(options: &WorkerOptions) -> Result<SpawnedWorker> {
    let fork = &options.fork_options;
    let program = match fork.program {
        Some(ref program) => program.clone(),
        None => std::env::current_exe()
            .map_err(|e| FarmError::Spawn(format!("Failed to get current executable: {}", e)))?,
    };

    let (response_read, response_write) = ipc::pipe()?;
    let response_raw = response_write.as_raw_fd();

    let mut cmd = Command::new(&program);
    cmd.args(&fork.args);
    cmd.envs(fork.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    if let Some(ref cwd) = fork.cwd {
        cmd.current_dir(cwd);
    }

    cmd.env(ENV_INTERNAL_WORKER, "1");
    cmd.env(ENV_WORKER_ID, options.ordinal().to_string());
    cmd.env(ENV_IPC_FD, CHILD_RESPONSE_FD.to_string());

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    // Safety: only async-signal-safe libc calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || install_response_fd(response_raw));
    }

    let mut child = cmd.spawn().map_err(|e| {
        FarmError::Spawn(format!("Failed to spawn {}: {}", program.display(), e))
    })?;

    // The child holds its own copy; ours must close so EOF follows the child's exit.
    drop(response_write);

    let proc = Proc::from_child(&mut child)?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FarmError::Spawn("Child stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FarmError::Spawn("Child stderr not captured".into()))?;

    tracing::debug!(
        worker_id = options.id,
        pid = proc.pid().as_raw(),
        program = %program.display(),
        "Spawned worker process"
    );

    Ok(SpawnedWorker {
        proc,
        responses: FrameReader::new(response_read),
        stdout,
        stderr,
    })
}

/// Place the response pipe at fd 3 without close-on-exec. Runs in the child.
fn install_response_fd(raw: i32) -> std::io::Result<()> {
    let rc = if raw == CHILD_RESPONSE_FD {
        unsafe { nix::libc::fcntl(raw, nix::libc::F_SETFD, 0) }
    } else {
        unsafe { nix::libc::dup2(raw, CHILD_RESPONSE_FD) }
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Spawn a named thread with a worker-sized stack.
pub fn spawn_named_thread<F, T>(name: String, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .stack_size(WORKER_THREAD_STACK_SIZE)
        .spawn(f)
        .map_err(|e| FarmError::Spawn(format!("Failed to spawn thread: {}", e)))
}

/// Forward every line of `reader` to `output`, dropping lines when it is full.
pub fn forward_output<R>(
    worker_id: WorkerId,
    stream: OutputStream,
    reader: R,
    output: Sender<OutputLine>,
) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let name = match stream {
        OutputStream::Stdout => format!("workfarm-stdout-{}", worker_id),
        OutputStream::Stderr => format!("workfarm-stderr-{}", worker_id),
    };
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            for line in BufReader::new(reader).lines() {
                let Ok(line) = line else { break };
                let item = OutputLine {
                    worker_id,
                    stream,
                    line,
                };
                // Full or disconnected: drop the line but keep draining the pipe
                let _ = output.try_send(item);
            }
        })
        .map_err(|e| FarmError::Spawn(format!("Failed to spawn output thread: {}", e)))
}
