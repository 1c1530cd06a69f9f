//! Postgraph server entry point
//!
//! All operations are exposed via GraphQL at /graphql.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use postgraph::config::Config;
use postgraph::db::{Database, seed_demo_data};
use postgraph::{AppState, build_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "postgraph=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Postgraph");
    let config = Arc::new(Config::from_env()?);
    tracing::info!("Configuration loaded");

    let db = Database::new();
    if config.seed_demo_data {
        seed_demo_data(&db).await.context("Failed to seed demo data")?;
    }

    let state = AppState::new(config.clone(), db);
    let subscriptions = state.subscriptions.clone();
    tracing::info!("GraphQL schema built");

    let app = build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on {}", addr);
    tracing::info!("GraphQL playground: {}/graphql", config.public_url());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    subscriptions.shutdown();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
