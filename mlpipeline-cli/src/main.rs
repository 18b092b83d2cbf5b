//! mlpipeline - run ML workflows from a configuration file.

mod cli;
mod commands;
mod telemetry;

use clap::Parser;
use std::process::ExitCode;

use cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = telemetry::init(cli.log_level.into(), cli.log_format) {
        eprintln!("error: {err:#}");
        return ExitCode::from(commands::EXIT_RUNTIME);
    }

    commands::dispatch(cli).await
}
