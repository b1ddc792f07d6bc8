//! IPC protocol between the scheduler and its workers.
//!
//! Every message is a JSON array whose first element is a small integer tag,
//! serialized on a single line. Scheduler→worker and worker→scheduler tags
//! live in separate namespaces.

use crate::error::{ClientError, FarmError, Result, SetupError};
use serde_json::{Map, Value, json};

pub const CHILD_MESSAGE_INITIALIZE: u64 = 0;
pub const CHILD_MESSAGE_CALL: u64 = 1;
pub const CHILD_MESSAGE_END: u64 = 2;

pub const PARENT_MESSAGE_OK: u64 = 0;
pub const PARENT_MESSAGE_CLIENT_ERROR: u64 = 1;
pub const PARENT_MESSAGE_SETUP_ERROR: u64 = 2;
pub const PARENT_MESSAGE_CUSTOM: u64 = 3;

/// Message from the scheduler to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildMessage {
    /// Load `module` and remember `setup_args` for the first call.
    Initialize {
        module: String,
        setup_args: Vec<Value>,
    },

    /// Invoke `method` on the loaded module.
    Call {
        /// Set once the farm has claimed this call for a worker.
        processed: bool,
        method: String,
        args: Vec<Value>,
    },

    /// Graceful shutdown request.
    End,
}

/// Message from a worker to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum ParentMessage {
    /// The call returned successfully.
    Ok(Value),
    /// The called method failed.
    ClientError(ClientError),
    /// The module failed to load or set up.
    SetupError(SetupError),
    /// Out-of-band payload emitted while a call is in flight. Non-terminal.
    Custom(Value),
}

impl ChildMessage {
    pub fn initialize(module: impl Into<String>, setup_args: Vec<Value>) -> Self {
        Self::Initialize {
            module: module.into(),
            setup_args,
        }
    }

    pub fn call(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            processed: false,
            method: method.into(),
            args,
        }
    }

    /// A call the farm already claimed for a worker.
    pub fn claimed_call(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call {
            processed: true,
            method: method.into(),
            args,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Initialize { module, setup_args } => {
                json!([CHILD_MESSAGE_INITIALIZE, false, module, setup_args])
            }
            Self::Call {
                processed,
                method,
                args,
            } => json!([CHILD_MESSAGE_CALL, processed, method, args]),
            Self::End => json!([CHILD_MESSAGE_END, false]),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let mut fields = Fields::new(value)?;
        match fields.tag()? {
            CHILD_MESSAGE_INITIALIZE => {
                fields.skip();
                let module = fields.string("module")?;
                let setup_args = fields.array("setup args")?;
                Ok(Self::Initialize { module, setup_args })
            }
            CHILD_MESSAGE_CALL => {
                let processed = fields.bool("processed flag")?;
                let method = fields.string("method")?;
                let args = fields.array("args")?;
                Ok(Self::Call {
                    processed,
                    method,
                    args,
                })
            }
            CHILD_MESSAGE_END => Ok(Self::End),
            other => Err(FarmError::Protocol(format!(
                "Unexpected request from scheduler: {}",
                other
            ))),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut line = self.to_value().to_string();
        line.push('\n');
        line
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(line.trim())?)
    }
}

impl ParentMessage {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Ok(result) => json!([PARENT_MESSAGE_OK, result]),
            Self::ClientError(err) => json!([
                PARENT_MESSAGE_CLIENT_ERROR,
                err.name,
                err.message,
                err.stack,
                Value::Object(err.extra.clone()),
            ]),
            Self::SetupError(err) => {
                json!([PARENT_MESSAGE_SETUP_ERROR, err.name, err.message, err.stack])
            }
            Self::Custom(payload) => json!([PARENT_MESSAGE_CUSTOM, payload]),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let mut fields = Fields::new(value)?;
        match fields.tag()? {
            PARENT_MESSAGE_OK => Ok(Self::Ok(fields.any())),
            PARENT_MESSAGE_CLIENT_ERROR => {
                let name = fields.string("error type")?;
                let message = fields.string("error message")?;
                let stack = fields.optional_string("stack")?;
                let extra = match fields.any() {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => {
                        return Err(FarmError::Protocol(format!(
                            "Expected error properties object, got {}",
                            other
                        )));
                    }
                };
                Ok(Self::ClientError(ClientError {
                    name,
                    message,
                    stack,
                    extra,
                }))
            }
            PARENT_MESSAGE_SETUP_ERROR => {
                let name = fields.string("error type")?;
                let message = fields.string("error message")?;
                let stack = fields.optional_string("stack")?;
                Ok(Self::SetupError(SetupError {
                    name,
                    message,
                    stack,
                }))
            }
            PARENT_MESSAGE_CUSTOM => Ok(Self::Custom(fields.any())),
            other => Err(FarmError::Protocol(format!(
                "Unexpected response from worker: {}",
                other
            ))),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut line = self.to_value().to_string();
        line.push('\n');
        line
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(line.trim())?)
    }
}

/// Positional reader over a message array.
struct Fields {
    items: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => Ok(Self {
                items: items.into_iter(),
            }),
            other => Err(FarmError::Protocol(format!(
                "Expected message array, got {}",
                other
            ))),
        }
    }

    fn tag(&mut self) -> Result<u64> {
        self.items
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| FarmError::Protocol("Message is missing its tag".into()))
    }

    fn skip(&mut self) {
        self.items.next();
    }

    /// Next field, `Null` when absent.
    fn any(&mut self) -> Value {
        self.items.next().unwrap_or(Value::Null)
    }

    fn string(&mut self, what: &str) -> Result<String> {
        match self.any() {
            Value::String(s) => Ok(s),
            other => Err(FarmError::Protocol(format!(
                "Expected {} string, got {}",
                what, other
            ))),
        }
    }

    fn optional_string(&mut self, what: &str) -> Result<Option<String>> {
        match self.any() {
            Value::String(s) => Ok(Some(s)),
            Value::Null => Ok(None),
            other => Err(FarmError::Protocol(format!(
                "Expected {} string, got {}",
                what, other
            ))),
        }
    }

    fn bool(&mut self, what: &str) -> Result<bool> {
        self.any()
            .as_bool()
            .ok_or_else(|| FarmError::Protocol(format!("Expected {} boolean", what)))
    }

    fn array(&mut self, what: &str) -> Result<Vec<Value>> {
        match self.any() {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(FarmError::Protocol(format!(
                "Expected {} array, got {}",
                what, other
            ))),
        }
    }
}
