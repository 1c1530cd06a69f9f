//! Posts repository

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{QueryStats, Store};

const TABLE: &str = "posts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub id: String,
    pub author_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreatePost {
    pub author_id: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Default)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub body: Option<String>,
}

pub struct PostRepository {
    store: Arc<RwLock<Store>>,
    stats: Arc<QueryStats>,
}

/// Newest first, id as tie-breaker
fn newest_first(a: &PostRecord, b: &PostRecord) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))
}

impl PostRepository {
    pub(crate) fn new(store: Arc<RwLock<Store>>, stats: Arc<QueryStats>) -> Self {
        Self { store, stats }
    }

    pub async fn create(&self, post: CreatePost) -> Result<PostRecord> {
        if post.title.trim().is_empty() {
            bail!("title must not be empty");
        }

        self.stats.record(TABLE);
        let mut store = self.store.write();
        if !store.users.contains_key(&post.author_id) {
            bail!("author {} does not exist", post.author_id);
        }

        let now = Utc::now();
        let record = PostRecord {
            id: Uuid::new_v4().to_string(),
            author_id: post.author_id,
            title: post.title.trim().to_string(),
            body: post.body,
            created_at: now,
            updated_at: now,
        };
        store.posts.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<PostRecord>> {
        self.stats.record(TABLE);
        Ok(self.store.read().posts.get(id).cloned())
    }

    /// One lookup for many ids; the result is aligned with `ids`.
    pub async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<PostRecord>>> {
        self.stats.record(TABLE);
        let store = self.store.read();
        Ok(ids.iter().map(|id| store.posts.get(id).cloned()).collect())
    }

    /// Page through all posts, newest first.
    pub async fn list(&self, limit: usize, offset: usize) -> Result<Vec<PostRecord>> {
        self.stats.record(TABLE);
        let store = self.store.read();
        let mut posts: Vec<_> = store.posts.values().cloned().collect();
        posts.sort_by(newest_first);
        Ok(posts.into_iter().skip(offset).take(limit).collect())
    }

    /// Posts of each author in `author_ids`, newest first; aligned with `author_ids`.
    pub async fn list_by_authors(&self, author_ids: &[String]) -> Result<Vec<Vec<PostRecord>>> {
        self.stats.record(TABLE);
        let store = self.store.read();
        let mut grouped: HashMap<&str, Vec<PostRecord>> = HashMap::new();
        for post in store.posts.values() {
            grouped.entry(post.author_id.as_str()).or_default().push(post.clone());
        }
        Ok(author_ids
            .iter()
            .map(|id| {
                let mut posts = grouped.remove(id.as_str()).unwrap_or_default();
                posts.sort_by(newest_first);
                posts
            })
            .collect())
    }

    pub async fn update(&self, id: &str, update: UpdatePost) -> Result<Option<PostRecord>> {
        if matches!(&update.title, Some(title) if title.trim().is_empty()) {
            bail!("title must not be empty");
        }

        self.stats.record(TABLE);
        let mut store = self.store.write();
        let Some(post) = store.posts.get_mut(id) else {
            return Ok(None);
        };
        if let Some(title) = update.title {
            post.title = title.trim().to_string();
        }
        if let Some(body) = update.body {
            post.body = body;
        }
        post.updated_at = Utc::now();
        Ok(Some(post.clone()))
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.read().posts.len())
    }
}
