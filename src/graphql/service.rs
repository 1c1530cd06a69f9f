//! HTTP routes for /graphql and /graphql/ws.
//!
//! Every query or mutation runs with a fresh [`ResolutionContext`]. The
//! handler holds a drop guard on the context's cancellation token, so a client
//! that goes away (dropping the handler future) or an elapsed request timeout
//! cancels that request's pending loads. The context is disposed once the
//! response is ready.

use std::time::Duration;

use async_graphql::http::GraphiQLSource;
use async_graphql::{ErrorExtensions, Pos};
use async_graphql_axum::{GraphQLProtocol, GraphQLRequest, GraphQLResponse, GraphQLWebSocket};
use axum::Router;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use axum::routing::get;
use tracing::{debug, warn};

use crate::AppState;
use crate::services::{ContextFactory, ResolutionContext};

use super::{PostgraphSchema, verify_token};

/// Routes for the GraphQL playground, HTTP API and WebSocket endpoint
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/graphql", get(graphiql).post(graphql_handler))
        .route("/graphql/ws", get(graphql_ws_handler))
}

/// Execute one query or mutation inside its own resolution context.
pub async fn execute(
    schema: &PostgraphSchema,
    contexts: &ContextFactory,
    request: async_graphql::Request,
    timeout: Duration,
) -> async_graphql::Response {
    execute_in(schema, contexts.create(), request, timeout).await
}

/// Execute one query or mutation inside `resolution`, which is cancelled when
/// `timeout` elapses or this future is dropped, and disposed afterwards.
pub async fn execute_in(
    schema: &PostgraphSchema,
    resolution: ResolutionContext,
    request: async_graphql::Request,
    timeout: Duration,
) -> async_graphql::Response {
    let _cancel_on_drop = resolution.cancel_on_drop();

    let request = request.data(resolution.clone());
    let response = match tokio::time::timeout(timeout, schema.execute(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "GraphQL request timed out");
            resolution.cancel();
            let error = async_graphql::Error::new("Request timed out")
                .extend_with(|_, e| e.set("code", "CANCELLED"))
                .into_server_error(Pos::default());
            async_graphql::Response::from_errors(vec![error])
        }
    };

    resolution.dispose();
    response
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn graphiql(headers: HeaderMap) -> impl IntoResponse {
    let accepts_html = headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);

    if accepts_html {
        axum::response::Html(
            GraphiQLSource::build()
                .endpoint("/graphql")
                .subscription_endpoint("/graphql/ws")
                .finish(),
        )
        .into_response()
    } else {
        (
            axum::http::StatusCode::METHOD_NOT_ALLOWED,
            axum::Json(serde_json::json!({
                "error": "GET requests are not supported for GraphQL queries. Use POST with Content-Type: application/json"
            })),
        )
            .into_response()
    }
}

async fn graphql_handler(State(state): State<AppState>, headers: HeaderMap, req: GraphQLRequest) -> GraphQLResponse {
    let mut request = req.into_inner();
    if let Some(token) = extract_token(&headers) {
        match verify_token(&token, &state.config.jwt_secret) {
            Ok(user) => {
                debug!(user_id = %user.user_id, "Authenticated request");
                request = request.data(user);
            }
            Err(e) => debug!(error = %e.message, "Ignoring invalid bearer token"),
        }
    }

    execute(&state.schema, &state.contexts, request, state.config.request_timeout)
        .await
        .into()
}

async fn graphql_ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    protocol: GraphQLProtocol,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let secret = state.config.jwt_secret.clone();
    let header_user = extract_token(&headers).and_then(|token| verify_token(&token, &secret).ok());

    ws.protocols(["graphql-transport-ws", "graphql-ws"])
        .on_upgrade(move |socket| {
            let mut ws = GraphQLWebSocket::new(socket, state.schema.clone(), protocol);
            if let Some(user) = header_user {
                let mut data = async_graphql::Data::default();
                data.insert(user);
                ws = ws.with_data(data);
            }

            ws.on_connection_init(move |params| {
                let secret = secret.clone();
                async move {
                    let mut data = async_graphql::Data::default();
                    if let Some(token) = params
                        .get("Authorization")
                        .or_else(|| params.get("authorization"))
                        .and_then(|v| v.as_str())
                    {
                        let token = token.strip_prefix("Bearer ").unwrap_or(token);
                        if let Ok(user) = verify_token(token, &secret) {
                            debug!(user_id = %user.user_id, "Authenticated WebSocket connection");
                            data.insert(user);
                        }
                    }
                    Ok(data)
                }
            })
            .serve()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_token(&headers).as_deref(), Some("abc.def"));
    }
}
