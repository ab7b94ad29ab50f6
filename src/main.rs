//! Roundtable - turn-taking coordination for cooperating agents
//!
//! Runs the three-layer turn scheduler over the configured roster, or
//! the deterministic beat executor via the 'beats' subcommand.
//!
//! Exit codes: 0 normal shutdown, 1 configuration error, 2 fatal
//! scheduler invariant violation.

mod agent;
mod beat;
mod bus;
mod cli;
mod config;
mod console;
mod sched;

use clap::Parser;
use cli::{Cli, Command, RunArgs};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Load local .env for developer workflows; the process environment
    // still takes precedence over .env values.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match config::Config::load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            eprintln!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Some(Command::Check) => {
            println!("configuration ok ({} agents)", config.agents.len());
            Ok(0)
        }
        Some(Command::Beats(args)) => cli::run::beats_demo(config, args).await.map(|_| 0),
        Some(Command::Run(args)) => cli::run::execute(config, args).await,
        None => {
            // No subcommand: run interactively with the defaults.
            let args = RunArgs {
                prompt: "Begin by introducing yourself.".to_string(),
                max_turns: None,
                simulate: false,
                transcript_out: None,
                interactive: true,
            };
            cli::run::execute(config, args).await
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = %err, "run failed");
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}
