//! GraphQL schema definition with queries, mutations, and subscriptions
//!
//! Reads go through the request's batch loaders. Mutations write to the store,
//! refresh the affected loader entries and publish an event for live
//! subscribers. All mutations except `createUser` require authentication.

use std::sync::Arc;

use async_graphql::{Context, ErrorExtensions, ID, Object, Result, Schema};
use tracing::info;

use crate::config::Config;
use crate::db::{CreateComment, CreatePost, CreateUser, Database, UpdatePost, UpdateUser};
use crate::services::events::topics;
use crate::services::subscriptions::SubscriptionManager;
use crate::services::ContextFactory;

use super::auth::{AuthExt, issue_token, require_owner};
use super::helpers::{bad_input, load_optional, loader, not_found, resolution};
use super::loaders::{COMMENTS_BY_POST, CommentsByPost, POSTS, POSTS_BY_AUTHOR, PostById, PostsByAuthor, USERS, UserById};
use super::subscriptions::SubscriptionRoot;
use super::types::*;

/// The GraphQL schema type
pub type PostgraphSchema = Schema<QueryRoot, MutationRoot, SubscriptionRoot>;

const MAX_PAGE_SIZE: i32 = 100;
const MAX_IDS_PER_QUERY: usize = 500;

/// Build the GraphQL schema with all resolvers
pub fn build_schema(
    db: Database,
    config: Arc<Config>,
    contexts: ContextFactory,
    subscriptions: Arc<SubscriptionManager>,
) -> PostgraphSchema {
    Schema::build(QueryRoot, MutationRoot, SubscriptionRoot)
        .data(db)
        .data(config)
        .data(contexts)
        .data(subscriptions)
        .finish()
}

// ============================================================================
// Query Root
// ============================================================================

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// The authenticated viewer
    async fn me(&self, ctx: &Context<'_>) -> Result<User> {
        let viewer = ctx.auth_user()?;
        let scope = resolution(ctx)?;
        load_optional::<UserById>(scope, USERS, viewer.user_id.clone())
            .await?
            .map(User::new)
            .ok_or_else(|| not_found("User", &viewer.user_id))
    }

    async fn user(&self, ctx: &Context<'_>, id: ID) -> Result<Option<User>> {
        let scope = resolution(ctx)?;
        Ok(load_optional::<UserById>(scope, USERS, id.to_string())
            .await?
            .map(User::new))
    }

    /// Case-insensitive username lookup
    async fn user_by_username(&self, ctx: &Context<'_>, username: String) -> Result<Option<User>> {
        let db = ctx.data::<Database>()?;
        let scope = resolution(ctx)?;
        let Some(user) = db.users().get_by_username(&username).await? else {
            return Ok(None);
        };
        loader::<UserById>(scope, USERS)?.prime(user.id.clone(), user.clone());
        Ok(Some(User::new(user)))
    }

    /// Several users at once; unknown ids yield `null` at their position
    async fn users(&self, ctx: &Context<'_>, ids: Vec<ID>) -> Result<Vec<Option<User>>> {
        if ids.len() > MAX_IDS_PER_QUERY {
            return Err(bad_input(format!("At most {MAX_IDS_PER_QUERY} ids per query")));
        }
        let scope = resolution(ctx)?;
        let users = loader::<UserById>(scope, USERS)?;
        let loaded = users.load_many(ids.into_iter().map(|id| id.to_string())).await;

        loaded
            .into_iter()
            .map(|result| match result {
                Ok(user) => Ok(Some(User::new(user))),
                Err(crate::services::LoadError::NotFound { .. }) => Ok(None),
                Err(e) => Err(e.extend()),
            })
            .collect()
    }

    async fn post(&self, ctx: &Context<'_>, id: ID) -> Result<Option<Post>> {
        let scope = resolution(ctx)?;
        Ok(load_optional::<PostById>(scope, POSTS, id.to_string())
            .await?
            .map(Post::new))
    }

    /// Posts, newest first
    async fn posts(
        &self,
        ctx: &Context<'_>,
        #[graphql(default = 20)] limit: i32,
        #[graphql(default = 0)] offset: i32,
    ) -> Result<Vec<Post>> {
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(bad_input(format!("limit must be between 1 and {MAX_PAGE_SIZE}")));
        }
        if offset < 0 {
            return Err(bad_input("offset must not be negative"));
        }

        let db = ctx.data::<Database>()?;
        let scope = resolution(ctx)?;
        let posts = db.posts().list(limit as usize, offset as usize).await?;

        let by_id = loader::<PostById>(scope, POSTS)?;
        for post in &posts {
            by_id.prime(post.id.clone(), post.clone());
        }
        Ok(posts.into_iter().map(Post::new).collect())
    }

    async fn comment(&self, ctx: &Context<'_>, id: ID) -> Result<Option<Comment>> {
        let db = ctx.data::<Database>()?;
        Ok(db.comments().get_by_id(&id).await?.map(Comment::new))
    }
}

// ============================================================================
// Mutation Root
// ============================================================================

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    /// Register a user. Returns a bearer token for it.
    async fn create_user(&self, ctx: &Context<'_>, input: CreateUserInput) -> Result<CreateUserResult> {
        let db = ctx.data::<Database>()?;
        let config = ctx.data::<Arc<Config>>()?;
        let scope = resolution(ctx)?;

        let user = db
            .users()
            .create(CreateUser {
                username: input.username,
                display_name: input.display_name,
                bio: input.bio,
            })
            .await
            .map_err(|e| bad_input(e.to_string()))?;
        loader::<UserById>(scope, USERS)?.prime(user.id.clone(), user.clone());

        let token = issue_token(&user.id, &user.username, &config.jwt_secret, config.token_ttl_secs)?;
        info!(user_id = %user.id, username = %user.username, "User created");
        Ok(CreateUserResult {
            user: User::new(user),
            token,
        })
    }

    async fn update_profile(&self, ctx: &Context<'_>, input: UpdateProfileInput) -> Result<User> {
        let viewer = ctx.auth_user()?;
        let db = ctx.data::<Database>()?;
        let scope = resolution(ctx)?;

        let update = UpdateUser {
            display_name: maybe_undefined(input.display_name),
            bio: maybe_undefined(input.bio),
        };
        let user = db
            .users()
            .update(&viewer.user_id, update)
            .await?
            .ok_or_else(|| not_found("User", &viewer.user_id))?;

        let users = loader::<UserById>(scope, USERS)?;
        users.clear(&user.id);
        users.prime(user.id.clone(), user.clone());
        scope.publish(&topics::user_updated(&user.id), &user)?;

        Ok(User::new(user))
    }

    // ------------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------------

    async fn create_post(&self, ctx: &Context<'_>, input: CreatePostInput) -> Result<Post> {
        let viewer = ctx.auth_user()?;
        let db = ctx.data::<Database>()?;
        let scope = resolution(ctx)?;

        let post = db
            .posts()
            .create(CreatePost {
                author_id: viewer.user_id.clone(),
                title: input.title,
                body: input.body,
            })
            .await
            .map_err(|e| bad_input(e.to_string()))?;

        loader::<PostById>(scope, POSTS)?.prime(post.id.clone(), post.clone());
        loader::<PostsByAuthor>(scope, POSTS_BY_AUTHOR)?.clear(&post.author_id);
        scope.publish(&topics::posts_by_author(&post.author_id), &post)?;

        Ok(Post::new(post))
    }

    /// Edit a post. Only its author may do this.
    async fn update_post(&self, ctx: &Context<'_>, id: ID, input: UpdatePostInput) -> Result<Post> {
        let viewer = ctx.auth_user()?;
        let db = ctx.data::<Database>()?;
        let scope = resolution(ctx)?;

        let existing = db
            .posts()
            .get_by_id(&id)
            .await?
            .ok_or_else(|| not_found("Post", &id))?;
        require_owner(viewer, &existing.author_id, "post")?;

        let post = db
            .posts()
            .update(
                &id,
                UpdatePost {
                    title: input.title,
                    body: input.body,
                },
            )
            .await
            .map_err(|e| bad_input(e.to_string()))?
            .ok_or_else(|| not_found("Post", &id))?;

        let posts = loader::<PostById>(scope, POSTS)?;
        posts.clear(&post.id);
        posts.prime(post.id.clone(), post.clone());
        loader::<PostsByAuthor>(scope, POSTS_BY_AUTHOR)?.clear(&post.author_id);
        scope.publish(&topics::post_updated(&post.id), &post)?;

        Ok(Post::new(post))
    }

    // ------------------------------------------------------------------------
    // Comments
    // ------------------------------------------------------------------------

    async fn create_comment(&self, ctx: &Context<'_>, post_id: ID, text: String) -> Result<Comment> {
        let viewer = ctx.auth_user()?;
        let db = ctx.data::<Database>()?;
        let scope = resolution(ctx)?;

        let comment = db
            .comments()
            .create(CreateComment {
                post_id: post_id.to_string(),
                author_id: viewer.user_id.clone(),
                text,
            })
            .await
            .map_err(|e| bad_input(e.to_string()))?;

        loader::<CommentsByPost>(scope, COMMENTS_BY_POST)?.clear(&comment.post_id);
        scope.publish(&topics::comments_on_post(&comment.post_id), &comment)?;

        Ok(Comment::new(comment))
    }

    /// Delete a comment. Only its author may do this.
    async fn delete_comment(&self, ctx: &Context<'_>, id: ID) -> Result<DeleteCommentResult> {
        let viewer = ctx.auth_user()?;
        let db = ctx.data::<Database>()?;
        let scope = resolution(ctx)?;

        let existing = db
            .comments()
            .get_by_id(&id)
            .await?
            .ok_or_else(|| not_found("Comment", &id))?;
        require_owner(viewer, &existing.author_id, "comment")?;

        let deleted = db.comments().delete(&id).await?;
        if let Some(comment) = &deleted {
            loader::<CommentsByPost>(scope, COMMENTS_BY_POST)?.clear(&comment.post_id);
            scope.publish(&topics::comment_deleted_on_post(&comment.post_id), comment)?;
        }

        Ok(DeleteCommentResult {
            success: deleted.is_some(),
            id,
        })
    }
}

fn maybe_undefined<T>(value: async_graphql::MaybeUndefined<T>) -> Option<Option<T>> {
    match value {
        async_graphql::MaybeUndefined::Undefined => None,
        async_graphql::MaybeUndefined::Null => Some(None),
        async_graphql::MaybeUndefined::Value(v) => Some(Some(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppState;
    use crate::graphql::service::execute;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};

    async fn author(db: &Database, username: &str) -> String {
        db.users()
            .create(CreateUser {
                username: username.to_string(),
                display_name: None,
                bio: None,
            })
            .await
            .unwrap()
            .id
    }

    async fn run(state: &AppState, query: &str) -> Value {
        let response = execute(
            &state.schema,
            &state.contexts,
            async_graphql::Request::new(query),
            state.config.request_timeout,
        )
        .await;
        serde_json::to_value(&response).unwrap()
    }

    #[tokio::test]
    async fn test_missing_author_nulls_only_that_field() {
        let db = Database::new();
        let kept = author(&db, "kept").await;
        let gone = author(&db, "gone").await;
        for (author_id, title) in [(&kept, "stays"), (&gone, "orphan")] {
            db.posts()
                .create(CreatePost {
                    author_id: author_id.clone(),
                    title: title.to_string(),
                    body: String::new(),
                })
                .await
                .unwrap();
        }
        db.remove_user(&gone);

        let state = AppState::new(Arc::new(Config::default()), db);
        let body = run(&state, "{ posts { title author { username } } }").await;

        let posts = body["data"]["posts"].as_array().unwrap();
        let author_of = |title: &str| {
            posts
                .iter()
                .find(|p| p["title"] == title)
                .map(|p| p["author"].clone())
                .unwrap()
        };
        assert_eq!(author_of("stays"), json!({ "username": "kept" }));
        assert_eq!(author_of("orphan"), Value::Null);

        let errors = body["errors"].as_array().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["extensions"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_users_query_keeps_positions() {
        let db = Database::new();
        let ada = author(&db, "ada").await;
        let state = AppState::new(Arc::new(Config::default()), db);

        let body = run(&state, &format!(r#"{{ users(ids: ["nope", "{ada}"]) {{ username }} }}"#)).await;
        assert_eq!(body["data"]["users"], json!([null, { "username": "ada" }]));
        assert!(body.get("errors").is_none());
    }

    #[tokio::test]
    async fn test_user_by_username_ignores_case() {
        let db = Database::new();
        author(&db, "Ada").await;
        let state = AppState::new(Arc::new(Config::default()), db);

        let body = run(&state, r#"{ userByUsername(username: "ADA") { username } }"#).await;
        assert_eq!(body["data"]["userByUsername"], json!({ "username": "Ada" }));

        let body = run(&state, r#"{ userByUsername(username: "bob") { username } }"#).await;
        assert_eq!(body["data"]["userByUsername"], Value::Null);
    }

    #[tokio::test]
    async fn test_posts_rejects_bad_limit() {
        let state = AppState::new(Arc::new(Config::default()), Database::new());
        let body = run(&state, "{ posts(limit: 0) { id } }").await;
        assert_eq!(body["errors"][0]["extensions"]["code"], "BAD_USER_INPUT");
    }
}
