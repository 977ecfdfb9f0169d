mod auth;
mod config;
mod error;
mod media;
mod rate_limit;
mod routes;
mod store;


use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production injects the environment.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("certsync_api=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting certsync-api with config: {:?}", config);

    let state = AppState::from_config(Arc::clone(&config)).await?;
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("certsync-api listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
