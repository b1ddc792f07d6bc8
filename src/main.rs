//! workfarm - drive a farm of demo workers from the command line.
//!
//! The binary doubles as the worker host: when spawned with the internal
//! worker environment it serves the demo module over its pipes instead.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::Level;
use workfarm::logging::{self, LogConfig};
use workfarm::{FarmError, FarmOptions, OutputLine, OutputStream, WorkerFarm, child, demo};

use cli::{CallArgs, Cli, Commands, StressArgs};

/// How long to keep draining worker output after the farm ended.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How often a pending call checks whether its worker crashed.
const LOST_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Prefix of the affinity keys the stress command generates.
const STICKY_KEY_PREFIX: &str = "key-";

/// Program entry point: serves as a worker if spawned as one, otherwise parses
/// CLI arguments, dispatches the selected command and reports top-level errors.
fn main() {
    child::run_if_worker(&demo::registry());

    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    logging::init(
        LogConfig::for_cli()
            .with_level(log_level(&cli))
            .with_format(cli.log_format)
            .with_env_overrides(),
    );

    let result = match &cli.command {
        Commands::Call(args) => cmd_call(&cli, args),
        Commands::Stress(args) => cmd_stress(&cli, args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        // Print the error chain if there are causes
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn log_level(cli: &Cli) -> Level {
    if cli.quiet {
        return Level::ERROR;
    }
    match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    }
}

fn farm_options(cli: &Cli) -> FarmOptions {
    let mut options = FarmOptions::new(demo::DEMO_MODULE)
        .with_registry(demo::registry())
        .with_execution(cli.execution)
        .with_scheduling_policy(cli.policy);
    if let Some(workers) = cli.workers {
        options = options.with_workers(workers);
    }
    options
}

/// Call one method and print its JSON result to stdout.
fn cmd_call(cli: &Cli, args: &CallArgs) -> Result<()> {
    let options = farm_options(cli).with_setup_args(args.setup_args.clone());
    let farm = WorkerFarm::new(options).context("Failed to start worker farm")?;
    let output = farm.output();

    let handle = farm.call(args.method.clone(), args.args.clone());
    let subscription = args.progress.then(|| {
        handle.on_custom_message(|payload| {
            eprintln!(
                "{} {}",
                "progress".if_supports_color(Stderr, |text| text.cyan()),
                payload
            );
        })
    });

    // A call lost to a crash stays parked until the farm ends, so poll for it.
    let result = loop {
        if let Some(result) = handle.wait_timeout(LOST_POLL_INTERVAL) {
            break result;
        }
        if farm.stats().lost_tasks > 0 {
            break Err(FarmError::Worker(
                "worker crashed while running the call".to_string(),
            ));
        }
    };
    if let Some(subscription) = subscription {
        subscription.unsubscribe();
    }

    farm.end().context("Failed to stop worker farm")?;
    drop(farm);
    print_worker_output(&output);

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(FarmError::Client(err)) => {
            if let Some(stack) = &err.stack {
                eprintln!("{}", stack.if_supports_color(Stderr, |text| text.dimmed()));
            }
            Err(FarmError::Client(err)).context(format!("Call to '{}' failed", args.method))
        }
        Err(e) => Err(e).context(format!("Call to '{}' failed", args.method)),
    }
}

/// Forward what the worker processes wrote, tagged with the worker ordinal.
fn print_worker_output(output: &crossbeam_channel::Receiver<OutputLine>) {
    while let Ok(line) = output.recv_timeout(OUTPUT_DRAIN_TIMEOUT) {
        let tag = match line.stream {
            OutputStream::Stdout => "out",
            OutputStream::Stderr => "err",
        };
        eprintln!(
            "{} {}",
            format!("[worker {} {}]", line.worker_id + 1, tag)
                .if_supports_color(Stderr, |text| text.dimmed()),
            line.line
        );
    }
}

/// Submit many calls at once and summarize how the farm handled them.
fn cmd_stress(cli: &Cli, args: &StressArgs) -> Result<()> {
    let mut options = farm_options(cli);
    if args.sticky_keys.is_some() {
        options = options.with_worker_key(|_, call_args| {
            call_args
                .last()
                .and_then(Value::as_str)
                .filter(|key| key.starts_with(STICKY_KEY_PREFIX))
                .map(String::from)
        });
    }
    let farm = WorkerFarm::new(options).context("Failed to start worker farm")?;

    let started = Instant::now();
    let handles: Vec<_> = (0..args.calls)
        .map(|i| {
            let mut call_args = args.args.clone();
            let key = args.sticky_keys.map(|keys| {
                let key = format!("{}{}", STICKY_KEY_PREFIX, i % keys.max(1));
                call_args.push(json!(key));
                key
            });
            (key, farm.call(args.method.clone(), call_args))
        })
        .collect();

    let mut failures = 0usize;
    let mut workers_by_key: BTreeMap<String, BTreeSet<u64>> = BTreeMap::new();
    for (key, handle) in handles {
        match handle.wait() {
            Ok(value) => {
                if let (Some(key), Some(worker)) = (key, value.as_u64())
                    && args.method == "worker_id"
                {
                    workers_by_key.entry(key).or_default().insert(worker);
                }
            }
            Err(e) => {
                failures += 1;
                tracing::debug!(error = %e, "Call failed");
            }
        }
    }
    let elapsed = started.elapsed();

    let stats = farm.stats();
    let end = farm.end().context("Failed to stop worker farm")?;

    let split_keys = workers_by_key.values().filter(|w| w.len() > 1).count();
    let per_worker: Vec<u64> = stats.pool.workers.iter().map(|w| w.jobs_completed).collect();
    let throughput = args.calls as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    if args.json {
        let summary = json!({
            "calls": args.calls,
            "failures": failures,
            "elapsed_ms": elapsed.as_millis() as u64,
            "calls_per_sec": throughput,
            "kind": stats.pool.kind.to_string(),
            "workers": stats.pool.worker_count,
            "jobs_per_worker": per_worker,
            "restarts": stats.pool.total_restarts,
            "lost_tasks": stats.lost_tasks,
            "split_keys": split_keys,
            "force_exited": end.force_exited,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{}",
        "Stress run".if_supports_color(Stdout, |text| text.bold())
    );
    println!(
        "  {} workers ({}), {} calls in {:.2?} ({:.0} calls/s)",
        stats.pool.worker_count, stats.pool.kind, args.calls, elapsed, throughput
    );
    println!("  jobs per worker: {:?}", per_worker);
    println!(
        "  failures: {}, restarts: {}, lost: {}",
        failures, stats.pool.total_restarts, stats.lost_tasks
    );
    if args.sticky_keys.is_some() && args.method == "worker_id" {
        let status = if split_keys == 0 {
            "every key stayed on one worker"
                .if_supports_color(Stdout, |text| text.green())
                .to_string()
        } else {
            format!("{} keys ran on more than one worker", split_keys)
                .if_supports_color(Stdout, |text| text.red())
                .to_string()
        };
        println!("  affinity: {}", status);
    }
    if end.force_exited {
        println!(
            "  {}",
            "some workers had to be force-exited".if_supports_color(Stdout, |text| text.yellow())
        );
    }

    if failures > 0 {
        anyhow::bail!("{} of {} calls failed", failures, args.calls);
    }
    Ok(())
}
