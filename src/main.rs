use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pathsync::api::{self, AppState};
use pathsync::config::{Config, STARTUP_STORE_ATTEMPTS, STARTUP_STORE_DELAY};
use pathsync::db::Database;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "pathsync=debug,tower_http=debug".into()),
    );

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.json_logs);

    let auth = match config.auth() {
        Ok(auth) => auth,
        Err(e) => {
            tracing::error!(error = %e, "Invalid auth configuration, exiting");
            std::process::exit(2);
        }
    };

    let path = config.database_path.clone();
    tracing::info!(path = %path.display(), "Opening store");

    let db = match Database::open_with_retry(path, STARTUP_STORE_ATTEMPTS, STARTUP_STORE_DELAY).await
    {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "Store unavailable, exiting");
            std::process::exit(1);
        }
    };

    let state = AppState::new(db, auth, config.sessions());
    if !state.auth.is_enabled() {
        tracing::warn!("Authentication disabled, every request runs as the local dev user");
    }

    let flusher = state.sessions.spawn_flusher();
    let sessions = state.sessions.clone();
    let app = api::create_router(state, config.cors_origins());

    let address = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("pathsync listening on http://{}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, flushing open sessions");
    flusher.abort();
    sessions.flush_all().await;

    Ok(())
}
