//! Topic names and subscription topic filters
//!
//! Topics are `family:id` strings. Families ending in `-updated` carry the latest
//! state of an entity; every other family is an event log.

use super::BackpressurePolicy;

pub const COMMENTS_ON_POST: &str = "comments-on-post";
pub const COMMENT_DELETED_ON_POST: &str = "comment-deleted-on-post";
pub const POST_UPDATED: &str = "post-updated";
pub const POSTS_BY_AUTHOR: &str = "posts-by-author";
pub const USER_UPDATED: &str = "user-updated";

pub fn comments_on_post(post_id: &str) -> String {
    format!("{COMMENTS_ON_POST}:{post_id}")
}

pub fn comment_deleted_on_post(post_id: &str) -> String {
    format!("{COMMENT_DELETED_ON_POST}:{post_id}")
}

pub fn post_updated(post_id: &str) -> String {
    format!("{POST_UPDATED}:{post_id}")
}

pub fn posts_by_author(author_id: &str) -> String {
    format!("{POSTS_BY_AUTHOR}:{author_id}")
}

pub fn user_updated(user_id: &str) -> String {
    format!("{USER_UPDATED}:{user_id}")
}

/// A subscription's topic match test, parsed once at subscribe time.
///
/// `*` matches everything, a trailing `*` matches by prefix, anything else is exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    All,
    Exact(String),
    Prefix(String),
}

impl TopicFilter {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Self::All;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_string()),
            None => Self::Exact(pattern.to_string()),
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => topic == exact,
            Self::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }

    /// Topic family (text before the first `:`) the filter is confined to, if any
    pub fn family(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Exact(exact) => Some(exact.split_once(':').map_or(exact.as_str(), |(family, _)| family)),
            Self::Prefix(prefix) => prefix.split_once(':').map(|(family, _)| family),
        }
    }

    /// Policy used when the subscriber does not pick one
    pub fn default_policy(&self) -> BackpressurePolicy {
        match self.family() {
            Some(family) if family.ends_with("-updated") => BackpressurePolicy::DropOldest,
            _ => BackpressurePolicy::Disconnect,
        }
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Exact(exact) => f.write_str(exact),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_match() {
        let exact = TopicFilter::parse("comments-on-post:42");
        assert!(exact.matches("comments-on-post:42"));
        assert!(!exact.matches("comments-on-post:420"));
        assert!(!exact.matches("comments-on-post:99"));

        let prefix = TopicFilter::parse("comments-on-post:*");
        assert_eq!(prefix, TopicFilter::Prefix("comments-on-post:".to_string()));
        assert!(prefix.matches("comments-on-post:99"));
        assert!(!prefix.matches("post-updated:99"));

        assert!(TopicFilter::parse("*").matches("anything"));
    }

    #[test]
    fn test_default_policy_by_family() {
        assert_eq!(
            TopicFilter::parse(&post_updated("1")).default_policy(),
            BackpressurePolicy::DropOldest
        );
        assert_eq!(
            TopicFilter::parse("user-updated:*").default_policy(),
            BackpressurePolicy::DropOldest
        );
        assert_eq!(
            TopicFilter::parse(&comments_on_post("1")).default_policy(),
            BackpressurePolicy::Disconnect
        );
        assert_eq!(TopicFilter::parse("*").default_policy(), BackpressurePolicy::Disconnect);
    }

    #[test]
    fn test_display_round_trips_pattern() {
        for pattern in ["*", "post-updated:*", "comments-on-post:7"] {
            assert_eq!(TopicFilter::parse(pattern).to_string(), pattern);
        }
    }
}
