use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod forwarder;
mod handlers;
mod models;
mod services;
mod signature;
mod store;
mod transform;

use config::Config;
use forwarder::{HttpForwarder, OrderForwarder};
use handlers::{AppState, create_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Initialize configuration
    let config = Config::from_env()?;

    // One client is shared by the token exchange and the forwarder
    let client = reqwest::Client::builder()
        .user_agent(concat!("innocigs-connector/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let forwarder = HttpForwarder::from_config(client.clone(), &config.innocigs).map(|f| {
        tracing::info!("InnoCigs endpoint: {}", f.endpoint());
        Arc::new(f) as Arc<dyn OrderForwarder>
    });

    let app_state = AppState::new(&config, client, forwarder);

    // Build the application
    let app = create_router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    // Log startup information
    config.log_startup_info();

    axum::serve(listener, app).await?;

    Ok(())
}
