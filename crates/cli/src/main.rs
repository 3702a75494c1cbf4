//! Pagewright CLI - Main Entry Point
//!
//! Runs, lists and checks browser verification scenarios.

use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{check, list, run, GlobalArgs};

/// Pagewright - browser verification with deterministic request mocking
#[derive(Parser)]
#[command(name = "pagewright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios in a real browser
    Run(run::RunArgs),

    /// List the available scenarios
    List,

    /// Load fixtures and scenarios and build every route table, without a browser
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.global.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run::execute(args, &cli.global).await,
        Commands::List => list::execute(&cli.global).map(|()| 0),
        Commands::Check => check::execute(&cli.global).map(|()| 0),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            2
        }
    };
    std::process::exit(code);
}
