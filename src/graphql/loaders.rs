//! Batch functions behind the GraphQL relation fields
//!
//! Each relation field resolves through a named loader so that sibling
//! resolvers in one pass share a single storage round trip:
//!
//! 1. `Post.author` for ten posts calls `load(author_id)` ten times
//! 2. The `users` loader collects the distinct ids within the flush window
//! 3. One `get_by_ids` call fetches them, aligned with the requested ids
//! 4. Each resolver's future settles with its own user (or `NotFound`)
//!
//! `users` is process-wide: public profiles look the same to every viewer.
//! The other loaders are request-scoped.

use async_trait::async_trait;
use tracing::debug;

use crate::config::Config;
use crate::db::{CommentRecord, Database, PostRecord, UserRecord};
use crate::services::loader::{
    BatchFn, BatchLoader, CachePolicy, KeyResult, LoadError, LoaderFactories, LoaderOptions, SharedSafe,
};

pub const USERS: &str = "users";
pub const POSTS: &str = "posts";
pub const POSTS_BY_AUTHOR: &str = "posts_by_author";
pub const COMMENTS_BY_POST: &str = "comments_by_post";

/// Users by id
pub struct UserById {
    db: Database,
}

#[async_trait]
impl BatchFn for UserById {
    type Key = String;
    type Value = UserRecord;

    async fn load(&self, keys: &[String]) -> anyhow::Result<Vec<KeyResult<UserRecord>>> {
        debug!(loader = USERS, keys = keys.len(), "Batch loading users");
        let users = self.db.users().get_by_ids(keys).await?;
        Ok(keys
            .iter()
            .zip(users)
            .map(|(id, user)| user.ok_or_else(|| LoadError::not_found("User", id)))
            .collect())
    }
}

/// Carries no viewer-specific data.
impl SharedSafe for UserById {}

/// Posts by id
pub struct PostById {
    db: Database,
}

#[async_trait]
impl BatchFn for PostById {
    type Key = String;
    type Value = PostRecord;

    async fn load(&self, keys: &[String]) -> anyhow::Result<Vec<KeyResult<PostRecord>>> {
        debug!(loader = POSTS, keys = keys.len(), "Batch loading posts");
        let posts = self.db.posts().get_by_ids(keys).await?;
        Ok(keys
            .iter()
            .zip(posts)
            .map(|(id, post)| post.ok_or_else(|| LoadError::not_found("Post", id)))
            .collect())
    }
}

/// All posts written by an author
pub struct PostsByAuthor {
    db: Database,
}

#[async_trait]
impl BatchFn for PostsByAuthor {
    type Key = String;
    type Value = Vec<PostRecord>;

    async fn load(&self, keys: &[String]) -> anyhow::Result<Vec<KeyResult<Vec<PostRecord>>>> {
        debug!(loader = POSTS_BY_AUTHOR, keys = keys.len(), "Batch loading posts by author");
        let grouped = self.db.posts().list_by_authors(keys).await?;
        Ok(grouped.into_iter().map(Ok).collect())
    }
}

/// All comments on a post
pub struct CommentsByPost {
    db: Database,
}

#[async_trait]
impl BatchFn for CommentsByPost {
    type Key = String;
    type Value = Vec<CommentRecord>;

    async fn load(&self, keys: &[String]) -> anyhow::Result<Vec<KeyResult<Vec<CommentRecord>>>> {
        debug!(loader = COMMENTS_BY_POST, keys = keys.len(), "Batch loading comments by post");
        let grouped = self.db.comments().list_by_posts(keys).await?;
        Ok(grouped.into_iter().map(Ok).collect())
    }
}

/// Register every relation loader the schema resolves through.
pub fn build_loader_factories(db: &Database, config: &Config) -> LoaderFactories {
    let options = LoaderOptions::default()
        .with_max_batch_size(config.loader_max_batch_size)
        .with_delay(config.loader_batch_delay);

    let users = BatchLoader::new(
        USERS,
        UserById { db: db.clone() },
        options.clone().with_cache(CachePolicy::Process {
            ttl: config.user_cache_ttl,
            max_entries: config.user_cache_max_entries,
        }),
    );

    let posts_db = db.clone();
    let by_author_db = db.clone();
    let comments_db = db.clone();

    LoaderFactories::new()
        .register_shared(users)
        .register(POSTS, options.clone(), move || PostById { db: posts_db.clone() })
        .register(POSTS_BY_AUTHOR, options.clone(), move || PostsByAuthor {
            db: by_author_db.clone(),
        })
        .register(COMMENTS_BY_POST, options, move || CommentsByPost {
            db: comments_db.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CreatePost, CreateUser};
    use crate::services::loader::LoaderRegistry;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn seeded() -> (Database, Vec<String>) {
        let db = Database::new();
        let mut ids = Vec::new();
        for name in ["ada", "bea", "cyd"] {
            let user = db
                .users()
                .create(CreateUser {
                    username: name.to_string(),
                    display_name: None,
                    bio: None,
                })
                .await
                .unwrap();
            db.posts()
                .create(CreatePost {
                    author_id: user.id.clone(),
                    title: format!("by {name}"),
                    body: String::new(),
                })
                .await
                .unwrap();
            ids.push(user.id);
        }
        (db, ids)
    }

    #[tokio::test]
    async fn test_users_coalesce_into_one_query() {
        let (db, ids) = seeded().await;
        let factories = Arc::new(build_loader_factories(&db, &Config::default()));
        let registry = LoaderRegistry::new(factories);
        let users = registry.get::<UserById>(USERS).unwrap();

        db.stats().reset();
        let futures: Vec<_> = ids.iter().chain(ids.iter()).map(|id| users.load(id.clone())).collect();
        let loaded = futures::future::join_all(futures).await;

        assert_eq!(db.stats().count("users"), 1);
        assert!(loaded.iter().all(|r| r.is_ok()));
        assert_eq!(loaded[0].as_ref().unwrap().username, "ada");
    }

    #[tokio::test]
    async fn test_missing_user_is_not_found() {
        let (db, ids) = seeded().await;
        let factories = Arc::new(build_loader_factories(&db, &Config::default()));
        let registry = LoaderRegistry::new(factories);
        let users = registry.get::<UserById>(USERS).unwrap();

        let results = users.load_many(vec![ids[0].clone(), "ghost".to_string()]).await;
        assert!(results[0].is_ok());
        assert_matches!(&results[1], Err(LoadError::NotFound { entity: "User", .. }));
    }

    #[tokio::test]
    async fn test_users_loader_shared_across_requests() {
        let (db, ids) = seeded().await;
        let factories = Arc::new(build_loader_factories(&db, &Config::default()));

        let first = LoaderRegistry::new(factories.clone());
        first.get::<UserById>(USERS).unwrap().load(ids[0].clone()).await.unwrap();
        first.dispose_all();

        db.stats().reset();
        let second = LoaderRegistry::new(factories);
        second.get::<UserById>(USERS).unwrap().load(ids[0].clone()).await.unwrap();
        assert_eq!(db.stats().count("users"), 0);
    }

    #[tokio::test]
    async fn test_posts_by_author_groups() {
        let (db, ids) = seeded().await;
        let factories = Arc::new(build_loader_factories(&db, &Config::default()));
        let registry = LoaderRegistry::new(factories);
        let loader = registry.get::<PostsByAuthor>(POSTS_BY_AUTHOR).unwrap();

        let posts = loader.load(ids[1].clone()).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "by bea");
        assert_eq!(loader.load("nobody".to_string()).await.unwrap(), vec![]);
    }
}
