//! Application state and HTTP router construction.
//!
//! Used by [main](crate) and by the integration tests to build the Axum app.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::graphql::{PostgraphSchema, build_loader_factories, build_schema};
use crate::services::events::EventBus;
use crate::services::subscriptions::{SubscriptionDefaults, SubscriptionManager};
use crate::services::ContextFactory;

/// Shared state for HTTP handlers (GraphQL, health routes).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Database,
    pub schema: PostgraphSchema,
    pub contexts: ContextFactory,
    pub subscriptions: Arc<SubscriptionManager>,
}

impl AppState {
    /// Wire the event bus, subscription manager, loaders and schema together.
    pub fn new(config: Arc<Config>, db: Database) -> Self {
        let bus = Arc::new(EventBus::new());
        let subscriptions = SubscriptionManager::new(
            bus.clone(),
            SubscriptionDefaults {
                queue_capacity: config.subscription_queue_capacity,
                ..Default::default()
            },
        );
        let contexts = ContextFactory::new(build_loader_factories(&db, &config), bus);
        let schema = build_schema(db.clone(), config.clone(), contexts.clone(), subscriptions.clone());

        Self {
            config,
            db,
            schema,
            contexts,
            subscriptions,
        }
    }
}

/// Build the full Axum router: health probes, /graphql, /graphql/ws and layers.
/// Returns Router<()> (state fully applied) for use with axum::serve.
pub fn build_app(state: AppState) -> Router<()> {
    Router::new()
        .merge(crate::api::health::router())
        .merge(crate::graphql::service::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
