// Helper functions shared across GraphQL resolvers.

use async_graphql::{Context, Error, ErrorExtensions, Result};

use crate::services::loader::{BatchFn, BatchLoader, LoadError, RegistryError};
use crate::services::subscriptions::SubscriptionError;
use crate::services::ResolutionContext;

fn coded(message: String, code: &'static str) -> Error {
    Error::new(message).extend_with(|_, e| e.set("code", code))
}

impl ErrorExtensions for LoadError {
    fn extend(&self) -> Error {
        coded(self.to_string(), self.code())
    }
}

impl ErrorExtensions for RegistryError {
    fn extend(&self) -> Error {
        coded(self.to_string(), "INTERNAL_SERVER_ERROR")
    }
}

impl ErrorExtensions for SubscriptionError {
    fn extend(&self) -> Error {
        coded(self.to_string(), self.code())
    }
}

pub(crate) fn bad_input(message: impl Into<String>) -> Error {
    coded(message.into(), "BAD_USER_INPUT")
}

pub(crate) fn not_found(entity: &str, id: &str) -> Error {
    coded(format!("{entity} {id} not found"), "NOT_FOUND")
}

/// The request's resolution context
pub(crate) fn resolution<'a>(ctx: &'a Context<'_>) -> Result<&'a ResolutionContext> {
    ctx.data::<ResolutionContext>()
        .map_err(|_| coded("No resolution context for this operation".to_string(), "INTERNAL_SERVER_ERROR"))
}

pub(crate) fn loader<F: BatchFn>(scope: &ResolutionContext, name: &str) -> Result<BatchLoader<F>> {
    scope.loader::<F>(name).map_err(|e| e.extend())
}

/// Load one value through the named loader.
pub(crate) async fn load_one<F: BatchFn>(scope: &ResolutionContext, name: &str, key: F::Key) -> Result<F::Value> {
    let future = loader::<F>(scope, name)?.load(key);
    future.await.map_err(|e| e.extend())
}

/// Like [`load_one`], but a missing key becomes `None` instead of an error.
pub(crate) async fn load_optional<F: BatchFn>(
    scope: &ResolutionContext,
    name: &str,
    key: F::Key,
) -> Result<Option<F::Value>> {
    let future = loader::<F>(scope, name)?.load(key);
    match future.await {
        Ok(value) => Ok(Some(value)),
        Err(LoadError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.extend()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_load_error_carries_code() {
        let error = LoadError::not_found("User", "u1").extend();
        let code = error
            .extensions
            .as_ref()
            .and_then(|ext| ext.get("code"))
            .cloned();
        assert_eq!(code, Some(async_graphql::Value::from("NOT_FOUND")));
        assert_eq!(error.message, "User u1 not found");
    }
}
