//! Handle on one worker child process.
//!
//! Owns the request pipe and the right to reap the child. The response pipe
//! is owned by the worker's collector thread.

use super::ipc::{FrameWriter, PipeFd};
use super::protocol::ChildMessage;
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{FarmError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long SIGTERM gets before SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(100);

/// Handle to a worker subprocess.
pub struct Proc {
    pid: Pid,
    /// Writer for sending requests to the worker's stdin
    writer: FrameWriter,
    /// Set once waitpid returned an exit status
    reaped: bool,
}

impl Proc {
    pub fn new(pid: Pid, stdin: PipeFd) -> Self {
        Self {
            pid,
            writer: FrameWriter::new(stdin),
            reaped: false,
        }
    }

    /// Create from a spawned `std::process::Child`, taking its stdin.
    pub fn from_child(child: &mut std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FarmError::Spawn("Child stdin not captured".into()))?;
        Ok(Self::new(pid, PipeFd::from(stdin)))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Write one request frame to the worker's stdin.
    pub fn send(&mut self, message: &ChildMessage) -> Result<()> {
        self.writer
            .write_frame(&message.to_line())
            .map_err(|e| FarmError::Worker(format!("Failed to send to worker: {}", e)))
    }

    /// Block until the process exits and reap it.
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Err(FarmError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.reaped = true;
                Ok(analyze_wait_status(status))
            }
            Err(e) => Err(FarmError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Reap the process if it has exited; `None` while it runs.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if self.reaped {
            return Err(FarmError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(analyze_wait_status(status)))
            }
            Err(e) => Err(FarmError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        signal::kill(self.pid, sig)
            .map_err(|e| FarmError::Worker(format!("Failed to send {}: {}", sig, e)))
    }

    /// Poll for exit for up to `within`. True once the process is reaped.
    fn reaped_within(&mut self, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            match self.try_wait() {
                Ok(None) => {}
                // Reaped now, or already reaped earlier.
                Ok(Some(_)) | Err(_) => return true,
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Ask the process to terminate (SIGTERM).
    pub fn terminate(&self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        self.signal(Signal::SIGTERM)
    }

    /// SIGKILL the process and reap it.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        if self.reaped {
            return Err(FarmError::Worker("Process already reaped".into()));
        }
        self.signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// Gracefully stop the worker: send `END`, wait up to `timeout`, then
    /// escalate to SIGTERM and finally SIGKILL.
    ///
    /// Returns `true` if a signal had to be used.
    pub fn stop(&mut self, timeout: Duration) -> Result<bool> {
        if self.reaped {
            return Ok(false);
        }

        // A worker that already died cannot take END; reaping below handles it.
        let _ = self.send(&ChildMessage::End);
        if self.reaped_within(timeout) {
            return Ok(false);
        }

        let _ = self.terminate();
        if self.reaped_within(TERM_GRACE) {
            return Ok(true);
        }

        self.kill()?;
        Ok(true)
    }

    /// Resident set size of the child in MiB, if the platform exposes it.
    pub fn rss_mib(&self) -> Option<u64> {
        read_process_rss_mib(self.pid.as_raw() as u32)
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        let _ = self.terminate();
        if !self.reaped_within(EXIT_POLL_INTERVAL) {
            let _ = self.kill();
        }
    }
}

/// Resident memory of `pid` in MiB, from the `VmRSS` line of `/proc/<pid>/status`.
#[cfg(target_os = "linux")]
pub fn read_process_rss_mib(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let kib: u64 = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))?
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib / 1024)
}

#[cfg(not(target_os = "linux"))]
pub fn read_process_rss_mib(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    #[test]
    fn test_proc_stop_closes_cat() {
        // `cat` ignores our END line but exits once stdin closes after SIGTERM.
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .expect("Failed to spawn cat");

        let mut proc = Proc::from_child(&mut child).expect("Failed to create Proc");
        assert!(proc.try_wait().unwrap().is_none());

        proc.stop(Duration::from_millis(50)).expect("Failed to stop");
        assert!(proc.try_wait().is_err(), "process should be reaped");
    }

    #[test]
    fn test_proc_wait_reports_exit_code() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 7"])
            .stdin(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sh");

        let mut proc = Proc::from_child(&mut child).unwrap();
        assert_eq!(proc.wait().unwrap(), TerminationReason::Exited(7));
    }

    #[test]
    fn test_proc_kill_reports_signal() {
        let mut child = Command::new("sleep")
            .arg("60")
            .stdin(Stdio::piped())
            .spawn()
            .expect("Failed to spawn sleep");

        let mut proc = Proc::from_child(&mut child).unwrap();
        assert_eq!(
            proc.kill().unwrap(),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_read_own_rss() {
        let rss = read_process_rss_mib(std::process::id()).expect("statm readable");
        assert!(rss >= 1, "test binary reports {} MiB resident", rss);
        assert!(rss < 10 * 1024);
    }
}
