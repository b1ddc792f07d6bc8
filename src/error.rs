//! Error types for workfarm.

use serde_json::{Map, Value};
use thiserror::Error;

/// Main error type for workfarm.
#[derive(Error, Debug)]
pub enum FarmError {
    /// The called method failed inside the worker.
    #[error("{0}")]
    Client(ClientError),

    /// The worker module could not be loaded or set up.
    #[error("{0}")]
    Setup(SetupError),

    /// A worker sent something the scheduler cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Farm is ended, no more calls can be done to it")]
    Ended,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for workfarm operations.
pub type Result<T> = std::result::Result<T, FarmError>;

/// An error raised by a worker module method, reconstructed on the scheduler side.
///
/// Carries the original type name (e.g. `TypeError`), message, optional stack
/// text, and any additional properties the module attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub extra: Map<String, Value>,
}

impl ClientError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            extra: Map::new(),
        }
    }

    /// Plain `Error` with the given message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Attach an extra property that travels with the error.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ClientError {}

/// Failure while loading or setting up a worker module.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error when calling setup: {}", self.message)
    }
}

impl std::error::Error for SetupError {}
