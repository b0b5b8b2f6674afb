mod config;
mod crdt;
mod db;
mod event;
mod frame;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use config::ServerConfig;
use services::access::PgAccessGate;
use services::session::PgAuthenticator;
use services::store::PgBlobStore;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let pool = db::init_pool(&config.database_url)
        .await
        .expect("database init failed");

    let state = state::AppState::new(
        Arc::new(PgBlobStore::new(pool.clone())),
        Arc::new(PgAuthenticator::new(pool.clone())),
        Arc::new(PgAccessGate::new(pool)),
        config.sync,
    );

    tracing::info!(
        save_debounce = ?config.sync.save_debounce,
        join_timeout = ?config.sync.join_timeout,
        client_queue_capacity = config.sync.client_queue_capacity,
        "sync config loaded"
    );

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, "roomsync listening");
    axum::serve(listener, app).await.expect("server failed");
}
