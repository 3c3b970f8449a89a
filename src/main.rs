use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ratewarden::clock::SystemClock;
use ratewarden::config::{EngineConfig, ServerConfig};
use ratewarden::distributed::MemoryEventBus;
use ratewarden::server::Server;
use ratewarden::store::MemoryStore;
use ratewarden::RateLimitEngine;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "ratewarden")]
#[command(about = "Distributed rate limiting service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Address to listen on (overrides BIND_ADDR)
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Redis URL (overrides RATELIMIT_STORE_URL)
        #[arg(long)]
        redis_url: Option<String>,

        /// Keep all state in process instead of Redis
        #[arg(long)]
        memory: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let server_config = ServerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load server configuration: {}", e))?;
    let mut config = EngineConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load engine configuration: {}", e))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("ratewarden={},tower_http=debug", server_config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Serve {
            bind,
            redis_url,
            memory,
        } => {
            if let Some(url) = redis_url {
                config.store_url = url;
            }
            let bind_addr = bind.unwrap_or(server_config.bind_addr);

            tracing::info!(
                bind_addr = %bind_addr,
                store = if memory { "memory" } else { config.store_url.as_str() },
                algorithm = %config.algorithm,
                "Starting ratewarden"
            );

            let builder = RateLimitEngine::builder(config);
            let builder = if memory {
                let clock = Arc::new(SystemClock::new());
                builder
                    .store(Arc::new(MemoryStore::new(clock.clone())))
                    .event_bus(Arc::new(MemoryEventBus::new()))
                    .clock(clock)
            } else {
                builder
            };
            let engine = builder
                .build()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to start engine: {}", e))?;

            Server::new(Arc::new(engine), bind_addr).run().await?;
        }
    }

    Ok(())
}
