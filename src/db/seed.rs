//! Demo data for a fresh in-memory store.
//!
//! Skipped when the store already has users, so calling it twice is harmless.

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::{CreateComment, CreatePost, CreateUser, Database};

/// Result of running seed operations.
#[derive(Debug, Default)]
pub struct SeedResult {
    pub users: usize,
    pub posts: usize,
    pub comments: usize,
}

const USERS: &[(&str, &str, &str)] = &[
    ("ada", "Ada", "Writes about compilers."),
    ("grace", "Grace", "Debugging since before it was cool."),
    ("linus", "Linus", "Mostly kernels."),
];

const POSTS: &[(usize, &str, &str)] = &[
    (0, "Batching field lookups", "Collect keys, then fetch them together."),
    (1, "Why subscriptions need backpressure", "A slow reader should only hurt itself."),
    (2, "Topic naming", "family:id keeps filters cheap."),
    (0, "Request-scoped caches", "Never leak one viewer's data to another."),
];

const COMMENTS: &[(usize, usize, &str)] = &[
    (0, 1, "This removed our N+1 queries."),
    (0, 2, "What about ordering?"),
    (1, 0, "Drop-oldest for state, disconnect for logs."),
    (3, 1, "Process-wide caches only for public data."),
];

pub async fn seed_demo_data(db: &Database) -> Result<SeedResult> {
    let mut result = SeedResult::default();
    if db.users().count().await? > 0 {
        debug!("Store already populated, skipping demo seed");
        return Ok(result);
    }

    let mut user_ids = Vec::with_capacity(USERS.len());
    for (username, display_name, bio) in USERS {
        let user = db
            .users()
            .create(CreateUser {
                username: username.to_string(),
                display_name: Some(display_name.to_string()),
                bio: Some(bio.to_string()),
            })
            .await
            .with_context(|| format!("Failed to seed user {username}"))?;
        user_ids.push(user.id);
        result.users += 1;
    }

    let mut post_ids = Vec::with_capacity(POSTS.len());
    for (author, title, body) in POSTS {
        let post = db
            .posts()
            .create(CreatePost {
                author_id: user_ids[*author].clone(),
                title: title.to_string(),
                body: body.to_string(),
            })
            .await
            .with_context(|| format!("Failed to seed post '{title}'"))?;
        post_ids.push(post.id);
        result.posts += 1;
    }

    for (post, author, text) in COMMENTS {
        db.comments()
            .create(CreateComment {
                post_id: post_ids[*post].clone(),
                author_id: user_ids[*author].clone(),
                text: text.to_string(),
            })
            .await
            .context("Failed to seed comment")?;
        result.comments += 1;
    }

    info!(
        users = result.users,
        posts = result.posts,
        comments = result.comments,
        "Seeded demo data"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let db = Database::new();
        let first = seed_demo_data(&db).await.unwrap();
        assert_eq!(first.users, USERS.len());
        assert_eq!(first.posts, POSTS.len());
        assert_eq!(first.comments, COMMENTS.len());

        let second = seed_demo_data(&db).await.unwrap();
        assert_eq!(second.users, 0);
        assert_eq!(db.posts().count().await.unwrap(), POSTS.len());
    }
}
