//! `audienced`: the audience segment server.
//!
//! Usage:
//!   audienced [-c <context-name-or-path>] [--listen <addr>] [--data-dir <dir>]
//!
//! The context name resolves to `/etc/audience/<name>.toml`.
//! If a path with `/` or `.` is given, it's used directly.

mod config;
mod routes;

use std::sync::Arc;

use audience_core::Module;
use clap::Parser;
use tracing::info;

use config::ServerConfig;

/// Audience segment server.
#[derive(Parser, Debug)]
#[command(name = "audienced", about = "Audience segment server")]
struct Cli {
    /// Context name or path to config file.
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Listen address (overrides the config file and the 0.0.0.0:8080 default).
    #[arg(long = "listen")]
    listen: Option<String>,

    /// Data directory (overrides `[storage] data_dir`).
    #[arg(long = "data-dir")]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load server configuration.
    let server_config = match &cli.config {
        Some(name) => {
            let path = ServerConfig::resolve_path(name);
            info!("Loading configuration from {}", path.display());
            ServerConfig::load(&path)?
        }
        None => ServerConfig::default(),
    };

    let core_config =
        server_config.service_config(cli.listen.as_deref(), cli.data_dir.as_deref());
    if let Some(dir) = &core_config.data_dir {
        std::fs::create_dir_all(dir)?;
    }

    // Initialize storage.
    let sqlite_path = core_config.resolve_sqlite_path();
    info!("Opening SQL store at {}", sqlite_path.display());
    let sql: Arc<dyn audience_sql::SQLStore> = Arc::new(
        audience_sql::SqliteStore::open(&sqlite_path)
            .map_err(|e| anyhow::anyhow!("failed to open SQL store: {}", e))?,
    );

    let segment_module =
        audience_segment::SegmentModule::new(Arc::clone(&sql), server_config.segments.clone())?;
    info!("Segment module initialized");

    let module_routes = vec![(segment_module.name(), segment_module.routes())];
    let app = routes::build_router(module_routes);

    // Start server.
    let listener = tokio::net::TcpListener::bind(&core_config.listen).await?;
    info!("audienced listening on {}", core_config.listen);
    axum::serve(listener, app).await?;

    Ok(())
}
