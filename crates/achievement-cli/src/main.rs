use std::process::ExitCode;

use achievement_cli::{init_tracing, run_cli, Cli, ErrorEnvelope};
use clap::Parser;

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(err) = init_tracing(cli.log_level()) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let envelope = ErrorEnvelope::from_error(&err);
            match serde_json::to_string(&envelope) {
                Ok(body) => eprintln!("{body}"),
                Err(_) => eprintln!("{err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}
