//! keel CLI
//!
//! Moves Cluster API workload clusters between management clusters.

use std::process::ExitCode;

use clap::Parser;

use keel_cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = keel_common::telemetry::init_logging(cli.log_format) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            for line in e.details() {
                eprintln!("  {}", line);
            }
            ExitCode::from(e.exit_code())
        }
    }
}
