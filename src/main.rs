use clap::Parser;
use tracing_subscriber::EnvFilter;

use job_dispatcher::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // -v forces debug; otherwise RUST_LOG, with the server defaulting to info
    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    } else if matches!(cli.command, Some(Commands::Serve { .. })) {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    } else if let Ok(filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = cli::dispatch(&cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
