use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = memory_evidence_cli::Cli::parse();
    match memory_evidence_cli::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[FAIL] {err:#}");
            ExitCode::FAILURE
        }
    }
}
