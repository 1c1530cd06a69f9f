//! GraphQL API
//!
//! The schema is the only public API surface besides the health probes.
//!
//! - `types`: entity objects whose relation fields resolve through batch loaders
//! - `loaders`: the batch functions and their registration
//! - `schema`: queries and mutations; mutations refresh loaders and publish
//! - `subscriptions`: live fields backed by the subscription manager
//! - `service`: HTTP and WebSocket handlers

pub mod auth;
mod helpers;
pub mod loaders;
mod schema;
pub mod service;
pub mod subscriptions;
pub mod types;

pub use auth::{AuthUser, issue_token, verify_token};
pub use loaders::build_loader_factories;
pub use schema::{MutationRoot, PostgraphSchema, QueryRoot, build_schema};
pub use subscriptions::SubscriptionRoot;
