//! GraphQL type definitions
//!
//! Entity objects wrap storage records. Relation fields resolve through the
//! named batch loaders and are nullable: a failing relation nulls only itself
//! and leaves an error with a `code` extension beside the partial result.
//!
//! Objects built for a subscription event carry their own resolution context;
//! everything else resolves against the request's context.

use async_graphql::{Context, Enum, ID, InputObject, Json, MaybeUndefined, Object, Result, SimpleObject};
use chrono::{DateTime, Utc};

use crate::db::{CommentRecord, PostRecord, UserRecord};
use crate::services::events::{BackpressurePolicy, Event};
use crate::services::ResolutionContext;

use super::helpers::{load_one, resolution};
use super::loaders::{COMMENTS_BY_POST, CommentsByPost, POSTS, POSTS_BY_AUTHOR, PostById, PostsByAuthor, USERS, UserById};

/// Context the nested fields of an object resolve against
fn scope<'a>(own: &'a Option<ResolutionContext>, ctx: &'a Context<'_>) -> Result<&'a ResolutionContext> {
    match own {
        Some(scope) => Ok(scope),
        None => resolution(ctx),
    }
}

// ============================================================================
// User
// ============================================================================

#[derive(Clone)]
pub struct User {
    record: UserRecord,
    scope: Option<ResolutionContext>,
}

impl User {
    pub fn new(record: UserRecord) -> Self {
        Self { record, scope: None }
    }

    pub fn scoped(record: UserRecord, scope: Option<ResolutionContext>) -> Self {
        Self { record, scope }
    }

    pub fn record(&self) -> &UserRecord {
        &self.record
    }
}

#[Object]
impl User {
    async fn id(&self) -> ID {
        ID(self.record.id.clone())
    }

    async fn username(&self) -> &str {
        &self.record.username
    }

    async fn display_name(&self) -> Option<&str> {
        self.record.display_name.as_deref()
    }

    async fn bio(&self) -> Option<&str> {
        self.record.bio.as_deref()
    }

    async fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    /// Posts written by this user, newest first
    async fn posts(&self, ctx: &Context<'_>) -> Result<Option<Vec<Post>>> {
        let scope = scope(&self.scope, ctx)?;
        let posts = load_one::<PostsByAuthor>(scope, POSTS_BY_AUTHOR, self.record.id.clone()).await?;
        Ok(Some(
            posts
                .into_iter()
                .map(|post| Post::scoped(post, self.scope.clone()))
                .collect(),
        ))
    }
}

// ============================================================================
// Post
// ============================================================================

#[derive(Clone)]
pub struct Post {
    record: PostRecord,
    scope: Option<ResolutionContext>,
}

impl Post {
    pub fn new(record: PostRecord) -> Self {
        Self { record, scope: None }
    }

    pub fn scoped(record: PostRecord, scope: Option<ResolutionContext>) -> Self {
        Self { record, scope }
    }

    pub fn record(&self) -> &PostRecord {
        &self.record
    }
}

#[Object]
impl Post {
    async fn id(&self) -> ID {
        ID(self.record.id.clone())
    }

    async fn author_id(&self) -> ID {
        ID(self.record.author_id.clone())
    }

    async fn title(&self) -> &str {
        &self.record.title
    }

    async fn body(&self) -> &str {
        &self.record.body
    }

    async fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    async fn updated_at(&self) -> DateTime<Utc> {
        self.record.updated_at
    }

    async fn author(&self, ctx: &Context<'_>) -> Result<Option<User>> {
        let scope = scope(&self.scope, ctx)?;
        let user = load_one::<UserById>(scope, USERS, self.record.author_id.clone()).await?;
        Ok(Some(User::scoped(user, self.scope.clone())))
    }

    /// Comments on this post, oldest first
    async fn comments(&self, ctx: &Context<'_>) -> Result<Option<Vec<Comment>>> {
        let scope = scope(&self.scope, ctx)?;
        let comments = load_one::<CommentsByPost>(scope, COMMENTS_BY_POST, self.record.id.clone()).await?;
        Ok(Some(
            comments
                .into_iter()
                .map(|comment| Comment::scoped(comment, self.scope.clone()))
                .collect(),
        ))
    }

    async fn comment_count(&self, ctx: &Context<'_>) -> Result<Option<i32>> {
        let scope = scope(&self.scope, ctx)?;
        let comments = load_one::<CommentsByPost>(scope, COMMENTS_BY_POST, self.record.id.clone()).await?;
        Ok(Some(comments.len() as i32))
    }
}

// ============================================================================
// Comment
// ============================================================================

#[derive(Clone)]
pub struct Comment {
    record: CommentRecord,
    scope: Option<ResolutionContext>,
}

impl Comment {
    pub fn new(record: CommentRecord) -> Self {
        Self { record, scope: None }
    }

    pub fn scoped(record: CommentRecord, scope: Option<ResolutionContext>) -> Self {
        Self { record, scope }
    }
}

#[Object]
impl Comment {
    async fn id(&self) -> ID {
        ID(self.record.id.clone())
    }

    async fn post_id(&self) -> ID {
        ID(self.record.post_id.clone())
    }

    async fn author_id(&self) -> ID {
        ID(self.record.author_id.clone())
    }

    async fn text(&self) -> &str {
        &self.record.text
    }

    async fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    async fn author(&self, ctx: &Context<'_>) -> Result<Option<User>> {
        let scope = scope(&self.scope, ctx)?;
        let user = load_one::<UserById>(scope, USERS, self.record.author_id.clone()).await?;
        Ok(Some(User::scoped(user, self.scope.clone())))
    }

    async fn post(&self, ctx: &Context<'_>) -> Result<Option<Post>> {
        let scope = scope(&self.scope, ctx)?;
        let post = load_one::<PostById>(scope, POSTS, self.record.post_id.clone()).await?;
        Ok(Some(Post::scoped(post, self.scope.clone())))
    }
}

// ============================================================================
// Inputs and payloads
// ============================================================================

#[derive(Debug, InputObject)]
pub struct CreateUserInput {
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
}

/// Omitted fields stay unchanged; `null` clears them.
#[derive(Debug, InputObject)]
pub struct UpdateProfileInput {
    pub display_name: MaybeUndefined<String>,
    pub bio: MaybeUndefined<String>,
}

#[derive(Debug, InputObject)]
pub struct CreatePostInput {
    pub title: String,
    #[graphql(default)]
    pub body: String,
}

#[derive(Debug, InputObject)]
pub struct UpdatePostInput {
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(SimpleObject)]
pub struct CreateUserResult {
    pub user: User,
    /// Bearer token for the new user
    pub token: String,
}

#[derive(Debug, SimpleObject)]
pub struct DeleteCommentResult {
    pub success: bool,
    pub id: ID,
}

// ============================================================================
// Subscription payloads
// ============================================================================

/// What to do when a subscriber falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
#[graphql(rename_items = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryPolicy {
    DropOldest,
    Disconnect,
}

impl From<DeliveryPolicy> for BackpressurePolicy {
    fn from(policy: DeliveryPolicy) -> Self {
        match policy {
            DeliveryPolicy::DropOldest => BackpressurePolicy::DropOldest,
            DeliveryPolicy::Disconnect => BackpressurePolicy::Disconnect,
        }
    }
}

/// A raw bus event, payload projected to the requested fields
#[derive(Debug, Clone, SimpleObject)]
pub struct EventMessage {
    pub topic: String,
    /// Per-topic sequence number, starting at 1
    pub sequence: i64,
    pub published_at: DateTime<Utc>,
    pub payload: Json<serde_json::Value>,
}

impl EventMessage {
    pub fn from_event(event: &Event, payload: serde_json::Value) -> Self {
        Self {
            topic: event.topic.to_string(),
            sequence: event.sequence as i64,
            published_at: event.published_at,
            payload: Json(payload),
        }
    }
}
