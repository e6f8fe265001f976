//! Arachne - Streaming Research Assistant
//!
//! Entry point: start the SSE API server, or run a single query from the
//! command line and print its events as line-delimited JSON.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use arachne_core::{api::ApiServer, api::ApiServerConfig, ArachneConfig};

#[derive(Parser)]
#[command(name = "arachne", version, about = "Streaming research assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the API server
    Serve {
        /// Port to listen on (overrides ARACHNE_ADDR)
        #[arg(short, long)]
        port: Option<u16>,
        /// Path to a crew definition YAML overriding the built-in one
        #[arg(long)]
        crew: Option<PathBuf>,
    },
    /// Run one query and print its events as line-delimited JSON
    Ask {
        /// The message or research query
        query: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arachne=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port, crew } => {
            // Configuration problems are fatal here, never per-request.
            let mut config = ArachneConfig::from_env()?;
            if let Some(port) = port {
                config.addr.set_port(port);
            }
            if crew.is_some() {
                config.crew_path = crew;
            }

            let (router, pipeline) = arachne_core::assemble(&config)?;
            let server = ApiServer::new(ApiServerConfig { addr: config.addr }, router, pipeline);
            info!("starting arachne v{}", env!("CARGO_PKG_VERSION"));
            server.serve().await
        }
        Command::Ask { query } => {
            let config = ArachneConfig::from_env()?;
            let (router, _pipeline) = arachne_core::assemble(&config)?;

            let (_session, mut events) = router.send_message("", &query).await;
            let stdout = std::io::stdout();
            while let Some(event) = events.next().await {
                use std::io::Write as _;
                let mut out = stdout.lock();
                serde_json::to_writer(&mut out, &event)?;
                writeln!(out)?;
            }
            Ok(())
        }
    }
}
