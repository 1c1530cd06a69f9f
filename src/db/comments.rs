//! Comments repository

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{QueryStats, Store};

const TABLE: &str = "comments";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateComment {
    pub post_id: String,
    pub author_id: String,
    pub text: String,
}

pub struct CommentRepository {
    store: Arc<RwLock<Store>>,
    stats: Arc<QueryStats>,
}

impl CommentRepository {
    pub(crate) fn new(store: Arc<RwLock<Store>>, stats: Arc<QueryStats>) -> Self {
        Self { store, stats }
    }

    pub async fn create(&self, comment: CreateComment) -> Result<CommentRecord> {
        let text = comment.text.trim();
        if text.is_empty() {
            bail!("comment text must not be empty");
        }

        self.stats.record(TABLE);
        let mut store = self.store.write();
        if !store.posts.contains_key(&comment.post_id) {
            bail!("post {} does not exist", comment.post_id);
        }
        if !store.users.contains_key(&comment.author_id) {
            bail!("author {} does not exist", comment.author_id);
        }

        let record = CommentRecord {
            id: Uuid::new_v4().to_string(),
            post_id: comment.post_id,
            author_id: comment.author_id,
            text: text.to_string(),
            created_at: Utc::now(),
        };
        store.comments.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<CommentRecord>> {
        self.stats.record(TABLE);
        Ok(self.store.read().comments.get(id).cloned())
    }

    /// Comments on each post in `post_ids`, oldest first; aligned with `post_ids`.
    pub async fn list_by_posts(&self, post_ids: &[String]) -> Result<Vec<Vec<CommentRecord>>> {
        self.stats.record(TABLE);
        let store = self.store.read();
        let mut grouped: HashMap<&str, Vec<CommentRecord>> = HashMap::new();
        for comment in store.comments.values() {
            grouped
                .entry(comment.post_id.as_str())
                .or_default()
                .push(comment.clone());
        }
        Ok(post_ids
            .iter()
            .map(|id| {
                let mut comments = grouped.remove(id.as_str()).unwrap_or_default();
                comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
                comments
            })
            .collect())
    }

    /// Remove a comment, returning it if it existed.
    pub async fn delete(&self, id: &str) -> Result<Option<CommentRecord>> {
        self.stats.record(TABLE);
        Ok(self.store.write().comments.remove(id))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CreatePost, CreateUser, Database};
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_comment_lifecycle() {
        let db = Database::new();
        let user = db
            .users()
            .create(CreateUser {
                username: "ada".to_string(),
                display_name: None,
                bio: None,
            })
            .await
            .unwrap();
        let post = db
            .posts()
            .create(CreatePost {
                author_id: user.id.clone(),
                title: "hello".to_string(),
                body: String::new(),
            })
            .await
            .unwrap();

        let comment = db
            .comments()
            .create(CreateComment {
                post_id: post.id.clone(),
                author_id: user.id.clone(),
                text: " hi ".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(comment.text, "hi");

        let listed = db.comments().list_by_posts(&[post.id.clone()]).await.unwrap();
        assert_eq!(listed, vec![vec![comment.clone()]]);

        assert_eq!(db.comments().delete(&comment.id).await.unwrap(), Some(comment));
        assert!(db.comments().list_by_posts(&[post.id]).await.unwrap()[0].is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_post() {
        let db = Database::new();
        let err = db
            .comments()
            .create(CreateComment {
                post_id: "nope".to_string(),
                author_id: "nobody".to_string(),
                text: "hi".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("post nope"));
    }
}
