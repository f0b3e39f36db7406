use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    governed_reputation_cli::init_tracing();
    let cli = governed_reputation_cli::Cli::parse();
    match governed_reputation_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => governed_reputation_cli::report_failure(&err),
    }
}
