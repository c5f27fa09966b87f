//! hopper API server

use std::path::PathBuf;

use clap::Parser;
use hopper_api::{AppState, routes};
use hopper_config::{LogFormat, ServerConfig, StorageConfig, load_server_config};
use hopper_db::{Stores, create_pool, run_migrations};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hopper-server")]
#[command(about = "Job scheduling server for Actions runners", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the server configuration
    #[arg(short, long, env = "HOPPER_CONFIG", default_value = "hopper.kdl")]
    config: PathBuf,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn build_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let tokens = config.api_tokens.clone();
    match &config.storage {
        StorageConfig::Postgres {
            url,
            max_connections,
        } => {
            info!("Connecting to database...");
            let pool = create_pool(url, *max_connections).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Ok(AppState::new(
                Stores::postgres(pool.clone()),
                &config.actions,
                tokens,
                Some(pool),
            ))
        }
        StorageConfig::Memory => {
            info!("Using in-memory storage; state is lost on restart");
            Ok(AppState::in_memory(&config.actions, tokens))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_server_config(&args.config)?;
    init_tracing(config.log_format);

    if config.api_tokens.is_empty() {
        tracing::warn!("No API tokens configured; the administrative API rejects every call");
    }

    let state = build_state(&config).await?;

    let dispatcher = state.scheduler.dispatcher.clone();
    let expiry = tokio::spawn(async move { dispatcher.run_expiry().await });

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.listen);
    let listener = TcpListener::bind(config.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    expiry.abort();

    Ok(())
}
