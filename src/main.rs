//! Voicegate - real-time voice assistant gateway.

use std::path::PathBuf;

use clap::Parser;

use voicegate::config::Config;
use voicegate::server;

#[derive(Debug, Parser)]
#[command(name = "voicegate", about = "Real-time voice assistant gateway", version)]
struct Args {
    /// Path to the configuration file (TOML)
    #[arg(long, env = "VOICEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // INFO by default; RUST_LOG overrides
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    server::start(config).await
}
