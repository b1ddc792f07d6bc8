//! Termination analysis for execution units.
//!
//! Decides whether a unit that stopped should be treated as a crash (and
//! transparently respawned) or as a clean exit.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker's execution unit terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal. SIGKILL is frequently the OOM killer.
    Signaled(Signal),
    /// Stack overflow (SIGSEGV on Linux, SIGBUS on macOS).
    StackOverflow(Signal),
    /// A thread worker's module panicked.
    Panicked(String),
    /// The response stream carried something that is not protocol.
    ProtocolViolation(String),
    /// Unknown termination reason.
    Unknown,
}

impl TerminationReason {
    /// Everything except a zero exit counts as a crash.
    pub fn is_crash(&self) -> bool {
        !matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGKILL) => {
                "killed by signal SIGKILL (possibly out of memory)".to_string()
            }
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StackOverflow(sig) => format!("stack overflow ({:?})", sig),
            Self::Panicked(msg) => format!("panicked: {}", msg),
            Self::ProtocolViolation(msg) => format!("protocol violation: {}", msg),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal @ (Signal::SIGSEGV | Signal::SIGBUS), _) => {
            TerminationReason::StackOverflow(signal)
        }
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        _ => TerminationReason::Unknown,
    }
}

/// Extract a readable message from a thread panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
