//! Users repository

use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{QueryStats, Store};

const TABLE: &str = "users";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateUser {
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
}

/// `None` leaves a field unchanged; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct UpdateUser {
    pub display_name: Option<Option<String>>,
    pub bio: Option<Option<String>>,
}

pub struct UserRepository {
    store: Arc<RwLock<Store>>,
    stats: Arc<QueryStats>,
}

impl UserRepository {
    pub(crate) fn new(store: Arc<RwLock<Store>>, stats: Arc<QueryStats>) -> Self {
        Self { store, stats }
    }

    pub async fn create(&self, user: CreateUser) -> Result<UserRecord> {
        let username = user.username.trim();
        if username.is_empty() {
            bail!("username must not be empty");
        }

        self.stats.record(TABLE);
        let mut store = self.store.write();
        if store.users.values().any(|u| u.username.eq_ignore_ascii_case(username)) {
            bail!("username '{}' is already taken", username);
        }

        let record = UserRecord {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            display_name: user.display_name,
            bio: user.bio,
            created_at: Utc::now(),
        };
        store.users.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        self.stats.record(TABLE);
        Ok(self.store.read().users.get(id).cloned())
    }

    /// One lookup for many ids; the result is aligned with `ids`.
    pub async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Option<UserRecord>>> {
        self.stats.record(TABLE);
        let store = self.store.read();
        Ok(ids.iter().map(|id| store.users.get(id).cloned()).collect())
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<UserRecord>> {
        self.stats.record(TABLE);
        Ok(self
            .store
            .read()
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    pub async fn update(&self, id: &str, update: UpdateUser) -> Result<Option<UserRecord>> {
        self.stats.record(TABLE);
        let mut store = self.store.write();
        let Some(user) = store.users.get_mut(id) else {
            return Ok(None);
        };
        if let Some(display_name) = update.display_name {
            user.display_name = display_name;
        }
        if let Some(bio) = update.bio {
            user.bio = bio;
        }
        Ok(Some(user.clone()))
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.read().users.len())
    }
}
