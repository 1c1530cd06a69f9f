//! Postgraph - GraphQL API over users, posts and comments
//!
//! Nested queries resolve through per-request batch loaders; mutations publish
//! to an in-process event bus that feeds bounded, per-subscriber delivery
//! queues for GraphQL subscriptions.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod graphql;
pub mod services;

pub use app::{AppState, build_app};
