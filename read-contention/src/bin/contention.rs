// Contended vs. uncontended read throughput on one shared word.
// Runs once with a writer in slot 0, once with readers only, and compares.
use std::io;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use read_contention::{run_test, RunParams, RunResult, ShmCell, CELL_NAME};

/// Anything not given as a flag is asked for on stdin.
#[derive(Debug, Parser)]
#[command(name = "contention", version, about)]
struct Args {
    /// Processes per run; in the contention run the first one is the writer
    #[arg(short, long, allow_hyphen_values = true)]
    processes: Option<String>,

    /// Writes per second for the writer
    #[arg(short, long, allow_hyphen_values = true)]
    write_rate: Option<String>,

    /// Length of each run in seconds
    #[arg(short, long, allow_hyphen_values = true)]
    duration: Option<String>,

    /// -v for debug, -vv to trace every write (RUST_LOG overrides)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// A fresh cell per run, so every run starts from zero.
fn measure(params: &RunParams, with_writer: bool) -> Result<RunResult> {
    let cell = ShmCell::create(CELL_NAME).context("creating shared cell")?;
    let result = run_test(&cell, params, with_writer).with_context(|| {
        if with_writer {
            "contention run failed"
        } else {
            "baseline run failed"
        }
    })?;
    cell.destroy().context("removing shared cell")?;
    Ok(result)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let params = RunParams::resolve(
        [args.processes, args.write_rate, args.duration],
        &mut io::stdin().lock(),
        &mut io::stdout(),
    )?;
    info!(
        processes = params.processes,
        write_rate = params.write_rate,
        duration_secs = params.duration.as_secs(),
        "starting"
    );

    println!("\nWith write contention:");
    let contended = measure(&params, true)?;
    println!("{contended}");

    println!("\nWithout write contention:");
    let baseline = measure(&params, false)?;
    println!("{baseline}");

    if baseline.throughput() > 0.0 {
        println!(
            "\nContended / baseline throughput: {:.3}",
            contended.throughput() / baseline.throughput()
        );
    }
    Ok(())
}
