//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use serde_json::Value;
use workfarm::logging::LogFormat;
use workfarm::{ExecutionKind, SchedulingPolicy};

/// Run calls against a farm of demo workers.
#[derive(Parser, Debug)]
#[command(name = "workfarm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Number of workers (default: available cores minus one).
    #[arg(short, long, global = true, env = "WORKFARM_WORKERS")]
    pub workers: Option<usize>,

    /// How idle workers are probed for unpinned calls.
    #[arg(long, global = true, value_enum, env = "WORKFARM_SCHEDULING", default_value_t = SchedulingPolicy::RoundRobin)]
    pub policy: SchedulingPolicy,

    /// Kind of execution unit backing each worker.
    #[arg(long, global = true, value_enum, env = "WORKFARM_EXECUTION", default_value_t = ExecutionKind::Auto)]
    pub execution: ExecutionKind,

    /// Enable verbose output (-v for info, -vv for debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR", value_parser = clap::builder::FalseyValueParser::new())]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Call one method of the demo module and print its result.
    Call(CallArgs),

    /// Fire many calls at the farm and report throughput.
    Stress(StressArgs),
}

/// Arguments for the call command.
#[derive(Parser, Debug)]
pub struct CallArgs {
    /// Method to call (echo, add, worker_id, pid, sleep_ms, throws_error, progress, ...).
    pub method: String,

    /// Arguments, each parsed as JSON (bare words are taken as strings).
    #[arg(value_parser = parse_json_arg)]
    pub args: Vec<Value>,

    /// JSON value passed to the module's setup (repeatable).
    #[arg(long = "setup", value_parser = parse_json_arg)]
    pub setup_args: Vec<Value>,

    /// Print custom messages emitted while the call runs.
    #[arg(long)]
    pub progress: bool,
}

/// Arguments for the stress command.
#[derive(Parser, Debug)]
pub struct StressArgs {
    /// Number of calls to submit.
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub calls: usize,

    /// Method to call for each request.
    #[arg(short, long, default_value = "worker_id")]
    pub method: String,

    /// Arguments for each call, parsed as JSON.
    #[arg(long = "arg", value_parser = parse_json_arg)]
    pub args: Vec<Value>,

    /// Spread calls over this many affinity keys and pin each key to a worker.
    #[arg(long)]
    pub sticky_keys: Option<usize>,

    /// Print the summary as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Parse a command-line argument as JSON, falling back to a plain string.
pub fn parse_json_arg(s: &str) -> Result<Value, String> {
    Ok(serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())))
}
