//! Server entry point: parse CLI flags, load configuration, open the
//! identity/session/collection stores, and serve the sync HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use cardsync_api::{app, AppState};
use cardsync_core::config::{IdentityConfig, ServerConfig};
use cardsync_db::CollectionStore;
use cardsync_users::{IdentityGateway, LocalIdentityGateway, SessionRegistry};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cardsync-server", about = "Self-hosted sync server for spaced-repetition clients")]
struct Args {
    /// Path to a TOML configuration file. Falls back to built-in
    /// defaults, then `CARDSYNC_*` environment variables, when absent.
    #[arg(long, env = "CARDSYNC_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(args.config.as_deref())?;
    init_tracing(&config.logging);

    info!(bind_addr = %config.bind_addr, data_dir = %config.data_dir.display(), "starting cardsync-server");

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(CollectionStore::new(&config.data_dir));
    let sessions = Arc::new(SessionRegistry::open(&config.session_db_path)?);
    let identity: Arc<dyn IdentityGateway> = match &config.identity {
        IdentityConfig::Local { user_db_path } => Arc::new(LocalIdentityGateway::open(user_db_path)?),
    };

    let bind_addr = config.bind_addr;
    let state = AppState::new(config, store, sessions, identity);
    let router = app(state);

    let listener = TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}

fn init_tracing(logging: &cardsync_core::config::LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
