//! Upsert layer: merges fetched posts and comments into persistent storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redcrawl_core::{Comment, Post, StoredComment, StoredPost};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{classify_sqlx_error, PgStore, MIGRATOR};

pub const CRATE_NAME: &str = "redcrawl-storage";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("invalid {kind} key {key:?}")]
    InvalidKey { kind: &'static str, key: String },
    #[error("could not decode stored row: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub posts: u64,
    pub comments: u64,
}

/// Idempotent, per-record atomic persistence of crawled content.
///
/// Every write is a single insert-or-update keyed by the natural id, so
/// duplicate deliveries and racing workers converge on one row.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new post or refresh the mutable fields of an existing one.
    ///
    /// `crawled_at` is set on insert only; `last_updated` on every call.
    async fn upsert_post(&self, post: &Post) -> Result<StoredPost, PersistenceError>;

    /// Same merge policy as [`RecordStore::upsert_post`], keyed by `comment_id`.
    /// The referenced post or parent comment need not exist yet.
    async fn upsert_comment(&self, comment: &Comment) -> Result<StoredComment, PersistenceError>;

    async fn post_last_updated(
        &self,
        post_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError>;

    async fn get_post(&self, post_id: &str) -> Result<Option<StoredPost>, PersistenceError>;

    async fn get_comment(&self, comment_id: &str)
        -> Result<Option<StoredComment>, PersistenceError>;

    async fn comments_for_post(&self, post_id: &str)
        -> Result<Vec<StoredComment>, PersistenceError>;

    async fn counts(&self) -> Result<StoreCounts, PersistenceError>;
}

pub(crate) fn validate_key(kind: &'static str, key: &str) -> Result<(), PersistenceError> {
    if key.is_empty() || key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(PersistenceError::InvalidKey {
            kind,
            key: key.to_string(),
        });
    }
    Ok(())
}

pub(crate) fn validate_post(post: &Post) -> Result<(), PersistenceError> {
    validate_key("post_id", &post.post_id)?;
    if post.subreddit.trim().is_empty() {
        return Err(PersistenceError::InvalidKey {
            kind: "subreddit",
            key: post.subreddit.clone(),
        });
    }
    Ok(())
}

pub(crate) fn validate_comment(comment: &Comment) -> Result<(), PersistenceError> {
    validate_key("comment_id", &comment.comment_id)?;
    validate_key("post_id", &comment.post_id)?;
    validate_key("parent_id", &comment.parent_id)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_with_whitespace_or_empty_are_rejected() {
        assert!(validate_key("post_id", "abc123").is_ok());
        assert!(matches!(
            validate_key("post_id", ""),
            Err(PersistenceError::InvalidKey { kind: "post_id", .. })
        ));
        assert!(validate_key("post_id", "ab c").is_err());
        assert!(validate_key("post_id", "ab\n").is_err());
    }

    #[test]
    fn comment_validation_checks_all_references() {
        let mut comment = test_support::comment("c1", "p1", "p1", 1);
        assert!(validate_comment(&comment).is_ok());
        comment.parent_id = String::new();
        assert!(matches!(
            validate_comment(&comment),
            Err(PersistenceError::InvalidKey { kind: "parent_id", .. })
        ));
    }
}
