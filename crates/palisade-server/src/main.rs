//! Connection runtime server binary.
//!
//! # Usage
//!
//! ```bash
//! palisade-server --bind 0.0.0.0:7878
//! palisade-server --bind 0.0.0.0:7878 --config palisade.toml
//! ```

use clap::Parser;
use palisade_server::config::{Args, ServerConfig};
use palisade_server::Server;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let log_level = args.log_level.clone();
    let config = ServerConfig::resolve(args)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(bind = %config.bind, "connection runtime starting");

    let server = Server::bind(&config).await?;
    tracing::info!(addr = %server.local_addr()?, "listening");

    server.run().await?;

    Ok(())
}
