//! API route definitions
//!
//! The primary API is GraphQL at /graphql. The REST surface is limited to
//! liveness and readiness probes.

pub mod health;
