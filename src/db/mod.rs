//! In-memory storage for users, posts and comments
//!
//! Repositories are cheap handles over one shared store. Bulk lookups return
//! results positionally aligned with the requested ids, which is the shape the
//! batch loaders hand back to the resolution layer.

pub mod comments;
pub mod posts;
pub mod seed;
pub mod users;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

pub use comments::{CommentRecord, CommentRepository, CreateComment};
pub use posts::{CreatePost, PostRecord, PostRepository, UpdatePost};
pub use seed::{SeedResult, seed_demo_data};
pub use users::{CreateUser, UpdateUser, UserRecord, UserRepository};

#[derive(Default)]
pub(crate) struct Store {
    pub users: HashMap<String, UserRecord>,
    pub posts: HashMap<String, PostRecord>,
    pub comments: HashMap<String, CommentRecord>,
}

/// Count of round trips per table, for spotting N+1 access patterns.
#[derive(Default)]
pub struct QueryStats {
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl QueryStats {
    pub(crate) fn record(&self, table: &'static str) {
        *self.counts.lock().entry(table).or_insert(0) += 1;
    }

    pub fn count(&self, table: &str) -> u64 {
        self.counts.lock().get(table).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

/// Database handle shared by repositories
#[derive(Clone, Default)]
pub struct Database {
    store: Arc<RwLock<Store>>,
    stats: Arc<QueryStats>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a users repository
    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.store.clone(), self.stats.clone())
    }

    /// Get a posts repository
    pub fn posts(&self) -> PostRepository {
        PostRepository::new(self.store.clone(), self.stats.clone())
    }

    /// Get a comments repository
    pub fn comments(&self) -> CommentRepository {
        CommentRepository::new(self.store.clone(), self.stats.clone())
    }

    pub fn stats(&self) -> &QueryStats {
        &self.stats
    }

    /// Cheap liveness probe for readiness checks
    pub fn ping(&self) -> bool {
        self.store.try_read_for(Duration::from_millis(100)).is_some()
    }

    /// Drop a user without touching their posts, leaving dangling author ids.
    #[cfg(test)]
    pub(crate) fn remove_user(&self, id: &str) {
        self.store.write().users.remove(id);
    }
}
