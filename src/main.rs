//! taskline - forked-task runtime
//!
//! The binary a worker spawns to run one task in its own process. The
//! parent writes the task context into a handoff file and launches
//! `taskline fork <handoff>`; this process reads the context, executes
//! the script sequence in-process, and overwrites the same file with
//! the result before exiting.
//!
//! A zero exit code means "a result was reported", including results
//! that carry a task failure; a non-zero exit means the runtime itself
//! could not complete the handoff, which the parent classifies as a
//! process failure.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use taskline::WorkerConfig;
use taskline::executor::{
    InProcessExecutor, LogSink, TaskExecutor, delete_with_retry, read_context, write_result,
};
use taskline::logging::{DEFAULT_LOG_FILTER, init_logging};

#[derive(Parser)]
#[command(name = "taskline", version, about = "Task execution runtime")]
struct Cli {
    /// Tracing filter directive
    #[arg(long, global = true, default_value = DEFAULT_LOG_FILTER)]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task from a handoff file and write the result back
    Fork {
        /// Path of the handoff file holding the task context
        handoff: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_filter);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "Forked runtime failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Fork { handoff } => fork(&handoff),
    }
}

fn fork(handoff: &std::path::Path) -> Result<()> {
    let config = WorkerConfig::default();

    let context = read_context(handoff)
        .with_context(|| format!("reading task context from {}", handoff.display()))?;
    // The context is consumed on read; a stale handoff must never be
    // mistaken for a result by the parent.
    delete_with_retry(
        handoff,
        config.delete_retry_attempts,
        Duration::from_millis(config.delete_retry_backoff_ms),
    )
    .context("consuming handoff file")?;

    tracing::info!(task = %context.id, "Forked runtime starting task");
    let executor = InProcessExecutor::new(config);
    let result = executor.execute(&context, &LogSink::stdout(), &LogSink::stderr());

    write_result(handoff, &result)
        .with_context(|| format!("writing task result to {}", handoff.display()))?;
    Ok(())
}
