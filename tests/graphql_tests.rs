//! End-to-end tests through the schema and the HTTP router

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use postgraph::config::Config;
use postgraph::db::{CreatePost, CreateUser, Database, PostRecord, UserRecord};
use postgraph::graphql::AuthUser;
use postgraph::graphql::loaders::{POSTS, PostById};
use postgraph::graphql::service::{execute, execute_in};
use postgraph::services::LoadError;
use postgraph::{AppState, build_app};

fn app_state(db: Database) -> AppState {
    AppState::new(Arc::new(Config::default()), db)
}

async fn user(db: &Database, username: &str) -> UserRecord {
    db.users()
        .create(CreateUser {
            username: username.to_string(),
            display_name: None,
            bio: None,
        })
        .await
        .unwrap()
}

async fn post(db: &Database, author_id: &str, title: &str) -> PostRecord {
    db.posts()
        .create(CreatePost {
            author_id: author_id.to_string(),
            title: title.to_string(),
            body: String::new(),
        })
        .await
        .unwrap()
}

async fn run(state: &AppState, request: impl Into<async_graphql::Request>) -> Value {
    let response = execute(&state.schema, &state.contexts, request.into(), state.config.request_timeout).await;
    serde_json::to_value(&response).unwrap()
}

fn as_viewer(query: &str, viewer: &UserRecord) -> async_graphql::Request {
    async_graphql::Request::new(query).data(AuthUser {
        user_id: viewer.id.clone(),
        username: viewer.username.clone(),
    })
}

async fn post_json(state: &AppState, body: Value, token: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::post("/graphql").header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let response = build_app(state.clone())
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_post_authors_load_in_one_batch() {
    let db = Database::new();
    for i in 0..10 {
        let author = user(&db, &format!("author{i}")).await;
        post(&db, &author.id, &format!("post {i}")).await;
    }
    db.stats().reset();

    let state = app_state(db.clone());
    let body = run(&state, "{ posts { title author { username } } }").await;

    assert!(body.get("errors").is_none(), "unexpected errors: {body}");
    let posts = body["data"]["posts"].as_array().unwrap();
    assert_eq!(posts.len(), 10);
    assert!(posts.iter().all(|p| p["author"]["username"].is_string()));

    assert_eq!(db.stats().count("users"), 1);
    assert_eq!(db.stats().count("posts"), 1);
}

#[tokio::test]
async fn test_nested_comments_batch_per_level() {
    let db = Database::new();
    let ada = user(&db, "ada").await;
    let bob = user(&db, "bob").await;
    let first = post(&db, &ada.id, "first").await;
    let second = post(&db, &bob.id, "second").await;
    for (post_id, author) in [(&first.id, &bob), (&second.id, &ada), (&second.id, &bob)] {
        db.comments()
            .create(postgraph::db::CreateComment {
                post_id: post_id.clone(),
                author_id: author.id.clone(),
                text: "hi".to_string(),
            })
            .await
            .unwrap();
    }
    db.stats().reset();

    let state = app_state(db.clone());
    let body = run(
        &state,
        "{ posts { title commentCount comments { text author { username } } } }",
    )
    .await;

    assert!(body.get("errors").is_none(), "unexpected errors: {body}");
    let counts: Vec<i64> = body["data"]["posts"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["commentCount"].as_i64().unwrap())
        .collect();
    assert_eq!(counts.iter().sum::<i64>(), 3);
    // commentCount and comments share one batch and one cache entry
    assert_eq!(db.stats().count("comments"), 1);
    assert_eq!(db.stats().count("users"), 1);
}

#[tokio::test]
async fn test_comment_added_only_sees_its_post() {
    let db = Database::new();
    let ada = user(&db, "ada").await;
    let watched = post(&db, &ada.id, "watched").await;
    let other = post(&db, &ada.id, "other").await;
    let state = app_state(db);

    let mut stream = state.schema.execute_stream(format!(
        r#"subscription {{ commentAdded(postId: "{}") {{ text author {{ username }} }} }}"#,
        watched.id
    ));
    // the first poll runs the resolver, which registers the subscription
    assert!(tokio::time::timeout(Duration::from_millis(50), stream.next()).await.is_err());
    assert_eq!(state.subscriptions.active_count(), 1);

    let add = |post_id: &str, text: &str| {
        format!(r#"mutation {{ createComment(postId: "{post_id}", text: "{text}") {{ id }} }}"#)
    };
    let body = run(&state, as_viewer(&add(&other.id, "elsewhere"), &ada)).await;
    assert!(body.get("errors").is_none(), "unexpected errors: {body}");
    let body = run(&state, as_viewer(&add(&watched.id, "hello"), &ada)).await;
    assert!(body.get("errors").is_none(), "unexpected errors: {body}");

    let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("no event delivered")
        .expect("stream ended");
    assert_eq!(
        event.data.into_json().unwrap(),
        json!({ "commentAdded": { "text": "hello", "author": { "username": "ada" } } })
    );
    assert!(tokio::time::timeout(Duration::from_millis(100), stream.next()).await.is_err());

    drop(stream);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.subscriptions.active_count(), 0);
}

#[tokio::test]
async fn test_events_projects_requested_fields() {
    let db = Database::new();
    let ada = user(&db, "ada").await;
    let state = app_state(db);

    let mut stream = state.schema.execute_stream(format!(
        r#"subscription {{ events(topic: "user-updated:{}", fields: ["bio"]) {{ topic sequence payload }} }}"#,
        ada.id
    ));
    assert!(tokio::time::timeout(Duration::from_millis(50), stream.next()).await.is_err());

    let body = run(
        &state,
        as_viewer(r#"mutation { updateProfile(input: { bio: "hello" }) { bio } }"#, &ada),
    )
    .await;
    assert_eq!(body["data"]["updateProfile"]["bio"], "hello");

    let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("no event delivered")
        .expect("stream ended");
    assert_eq!(
        event.data.into_json().unwrap(),
        json!({ "events": {
            "topic": format!("user-updated:{}", ada.id),
            "sequence": 1,
            "payload": { "bio": "hello" },
        } })
    );
}

#[tokio::test]
async fn test_profile_update_refreshes_shared_user_cache() {
    let db = Database::new();
    let ada = user(&db, "ada").await;
    let state = app_state(db);

    let body = run(&state, format!(r#"{{ user(id: "{}") {{ displayName }} }}"#, ada.id)).await;
    assert_eq!(body["data"]["user"]["displayName"], Value::Null);

    let body = run(
        &state,
        as_viewer(
            r#"mutation { updateProfile(input: { displayName: "Ada L." }) { displayName } }"#,
            &ada,
        ),
    )
    .await;
    assert_eq!(body["data"]["updateProfile"]["displayName"], "Ada L.");

    // the process-wide users cache was refreshed by the mutation
    let body = run(&state, format!(r#"{{ user(id: "{}") {{ displayName }} }}"#, ada.id)).await;
    assert_eq!(body["data"]["user"]["displayName"], "Ada L.");
}

fn slow_loaders() -> AppState {
    let config = Config {
        loader_batch_delay: Duration::from_millis(500),
        request_timeout: Duration::from_millis(20),
        ..Default::default()
    };
    AppState::new(Arc::new(config), Database::new())
}

#[tokio::test]
async fn test_timeout_cancels_request_loaders() {
    let state = slow_loaders();
    let resolution = state.contexts.create();
    // Same instance the `post` resolver gets: one loader per name per request
    let posts = resolution.loader::<PostById>(POSTS).unwrap();
    let pending = posts.load("p1".to_string());

    let response = execute_in(
        &state.schema,
        resolution,
        async_graphql::Request::new(r#"{ post(id: "p1") { title } }"#),
        state.config.request_timeout,
    )
    .await;
    let body = serde_json::to_value(&response).unwrap();
    assert_eq!(body["errors"][0]["extensions"]["code"], "CANCELLED");

    let outcome = tokio::time::timeout(Duration::from_millis(100), pending)
        .await
        .expect("load still pending after cancellation");
    assert_eq!(outcome, Err(LoadError::Cancelled));
    assert!(posts.is_cancelled());
}

#[tokio::test]
async fn test_dropped_request_cancels_its_loaders() {
    let state = slow_loaders();
    let resolution = state.contexts.create();
    let posts = resolution.loader::<PostById>(POSTS).unwrap();
    let pending = posts.load("p1".to_string());

    let task = {
        let state = state.clone();
        tokio::spawn(async move {
            execute_in(
                &state.schema,
                resolution,
                async_graphql::Request::new(r#"{ post(id: "p1") { title } }"#),
                Duration::from_secs(30),
            )
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.abort();

    let outcome = tokio::time::timeout(Duration::from_millis(100), pending)
        .await
        .expect("load still pending after the request was dropped");
    assert_eq!(outcome, Err(LoadError::Cancelled));

    // A sibling request's loaders are untouched
    let sibling = state.contexts.create();
    assert!(!sibling.loader::<PostById>(POSTS).unwrap().is_cancelled());
}

#[tokio::test]
async fn test_mutations_require_a_token() {
    let state = app_state(Database::new());

    let create_post = json!({ "query": r#"mutation { createPost(input: { title: "t" }) { title author { username } } }"# });
    let (status, body) = post_json(&state, create_post.clone(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["errors"][0]["extensions"]["code"], "UNAUTHORIZED");

    let sign_up = json!({ "query": r#"mutation { createUser(input: { username: "ada" }) { token user { id } } }"# });
    let (_, body) = post_json(&state, sign_up, None).await;
    let token = body["data"]["createUser"]["token"].as_str().unwrap().to_string();

    let (_, body) = post_json(&state, create_post, Some(&token)).await;
    assert!(body.get("errors").is_none(), "unexpected errors: {body}");
    assert_eq!(
        body["data"]["createPost"],
        json!({ "title": "t", "author": { "username": "ada" } })
    );

    let (_, body) = post_json(&state, json!({ "query": "{ me { username } }" }), Some("not-a-token")).await;
    assert_eq!(body["errors"][0]["extensions"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_only_the_author_may_edit() {
    let db = Database::new();
    let ada = user(&db, "ada").await;
    let bob = user(&db, "bob").await;
    let draft = post(&db, &ada.id, "draft").await;
    let state = app_state(db);

    let edit = format!(r#"mutation {{ updatePost(id: "{}", input: {{ title: "mine" }}) {{ title }} }}"#, draft.id);
    let body = run(&state, as_viewer(&edit, &bob)).await;
    assert_eq!(body["errors"][0]["extensions"]["code"], "FORBIDDEN");

    let body = run(&state, as_viewer(&edit, &ada)).await;
    assert_eq!(body["data"]["updatePost"]["title"], "mine");
}

#[tokio::test]
async fn test_health_routes() {
    let state = app_state(Database::new());

    let response = build_app(state.clone())
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");

    let response = build_app(state)
        .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body, json!({ "ready": true, "database": true, "activeSubscriptions": 0 }));
}
