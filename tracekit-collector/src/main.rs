//! tracekitd is the trace collection and query server.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracekit_collector::{Config, Registry, Server};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tracekitd", version, about = "Trace collection and query server")]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let input = std::fs::read_to_string(&args.config)
        .map_err(|err| format!("couldn't load config {}: {err}", args.config.display()))?;
    let config = Config::parse(&input)?;
    let server = Server::from_config(&Registry::default(), &config).await?;
    server.run().await?;
    Ok(())
}
