use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redcrawl_core::{Clock, Comment, Post, StoredComment, StoredPost, SystemClock};
use tokio::sync::Mutex;

use crate::{validate_comment, validate_post, PersistenceError, RecordStore, StoreCounts};

#[derive(Debug, Default)]
struct Tables {
    posts: HashMap<String, StoredPost>,
    comments: HashMap<String, StoredComment>,
}

/// In-process store with the same merge policy as [`crate::PgStore`].
///
/// The table lock is held across read-merge-write and the commit timestamp is
/// taken under it, so the last writer to acquire the lock wins.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_post(existing: &mut StoredPost, incoming: &Post, now: DateTime<Utc>) {
    existing.post.title = incoming.title.clone();
    existing.post.author = incoming.author.clone();
    existing.post.score = incoming.score;
    existing.post.data = incoming.data.clone();
    existing.last_updated = now;
}

fn merge_comment(existing: &mut StoredComment, incoming: &Comment, now: DateTime<Utc>) {
    existing.comment.author = incoming.author.clone();
    existing.comment.score = incoming.score;
    existing.comment.body = incoming.body.clone();
    existing.comment.data = incoming.data.clone();
    existing.last_updated = now;
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert_post(&self, post: &Post) -> Result<StoredPost, PersistenceError> {
        validate_post(post)?;
        let mut tables = self.tables.lock().await;
        let now = self.clock.now();
        let row = tables
            .posts
            .entry(post.post_id.clone())
            .and_modify(|existing| merge_post(existing, post, now))
            .or_insert_with(|| StoredPost {
                post: post.clone(),
                last_updated: now,
                crawled_at: now,
            });
        Ok(row.clone())
    }

    async fn upsert_comment(&self, comment: &Comment) -> Result<StoredComment, PersistenceError> {
        validate_comment(comment)?;
        let mut tables = self.tables.lock().await;
        let now = self.clock.now();
        let row = tables
            .comments
            .entry(comment.comment_id.clone())
            .and_modify(|existing| merge_comment(existing, comment, now))
            .or_insert_with(|| StoredComment {
                comment: comment.clone(),
                last_updated: now,
                crawled_at: now,
            });
        Ok(row.clone())
    }

    async fn post_last_updated(
        &self,
        post_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let tables = self.tables.lock().await;
        Ok(tables.posts.get(post_id).map(|row| row.last_updated))
    }

    async fn get_post(&self, post_id: &str) -> Result<Option<StoredPost>, PersistenceError> {
        Ok(self.tables.lock().await.posts.get(post_id).cloned())
    }

    async fn get_comment(
        &self,
        comment_id: &str,
    ) -> Result<Option<StoredComment>, PersistenceError> {
        Ok(self.tables.lock().await.comments.get(comment_id).cloned())
    }

    async fn comments_for_post(
        &self,
        post_id: &str,
    ) -> Result<Vec<StoredComment>, PersistenceError> {
        let tables = self.tables.lock().await;
        let mut rows = tables
            .comments
            .values()
            .filter(|row| row.comment.post_id == post_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            a.comment
                .created_utc
                .cmp(&b.comment.created_utc)
                .then_with(|| a.comment.comment_id.cmp(&b.comment.comment_id))
        });
        Ok(rows)
    }

    async fn counts(&self) -> Result<StoreCounts, PersistenceError> {
        let tables = self.tables.lock().await;
        Ok(StoreCounts {
            posts: tables.posts.len() as u64,
            comments: tables.comments.len() as u64,
        })
    }
}
