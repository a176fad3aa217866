//! `coordinator` entry point: parses the command line and runs one command.
#![cfg_attr(not(any(test, doctest)), deny(clippy::unwrap_used))]
#![cfg_attr(not(any(test, doctest)), deny(clippy::expect_used))]

use std::io;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Report;
use coordinator::inbound::cli::{
    self, Cli, Command, EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_SUCCESS,
};
use tokio::runtime::Builder;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt};

fn main() -> ExitCode {
    if let Err(err) = color_eyre::install() {
        eprintln!("failed to install error reporter: {err}");
    }
    if let Err(err) = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .with_writer(io::stderr)
        .try_init()
    {
        warn!(error = %err, "tracing init failed");
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = err.exit_code();
            // `--help` and `--version` arrive here with exit code 0.
            if let Err(print_err) = err.print() {
                eprintln!("failed to print usage: {print_err}");
            }
            return ExitCode::from(u8::try_from(code).unwrap_or(EXIT_FAILURE));
        }
    };

    let runtime = match Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("{:?}", Report::new(err).wrap_err("failed to create Tokio runtime"));
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> ExitCode {
    let mut stdout = io::stdout();
    // `serve` handles SIGINT itself so it can shut down gracefully.
    let outcome = if matches!(cli.command, Command::Serve) {
        cli::run(cli, &mut stdout).await
    } else {
        tokio::select! {
            outcome = cli::run(cli, &mut stdout) => outcome,
            _ = tokio::signal::ctrl_c() => return ExitCode::from(EXIT_INTERRUPTED),
        }
    };

    match outcome {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(err) => {
            eprintln!("{:?}", Report::new(err));
            ExitCode::from(EXIT_FAILURE)
        }
    }
}
