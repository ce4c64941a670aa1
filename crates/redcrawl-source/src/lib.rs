//! Content source contracts + the Reddit and fixture-backed implementations.

use std::time::Duration;

use async_trait::async_trait;
use redcrawl_core::{Comment, Cursor, Post};
use thiserror::Error;

mod fixture;
mod listing;
mod reddit;

pub use fixture::FixtureSource;
pub use listing::{parse_post_listing, parse_thread, ListingError, MAX_THREAD_NESTING};
pub use reddit::{
    classify_reqwest_error, classify_status, RedditClientConfig, RedditCredentials, RedditSource,
    RetryDisposition, TokenBucket, TokenBucketConfig,
};

pub const CRATE_NAME: &str = "redcrawl-source";

/// One page of a subreddit listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostPage {
    pub posts: Vec<Post>,
    pub next_cursor: Option<Cursor>,
}

/// A post together with its flattened comment tree.
///
/// Comments are in depth-first order; a parent always precedes its replies.
#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub post: Post,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Rate limits, timeouts, 5xx: worth retrying later.
    #[error("transient fetch failure for {target}: {reason}")]
    Transient {
        target: String,
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Missing or deleted content, auth failures, malformed payloads.
    #[error("permanent fetch failure for {target}: {reason}")]
    Permanent { target: String, reason: String },
}

impl FetchError {
    pub fn transient(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            target: target.into(),
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Server-suggested wait before retrying, when one was given.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            Self::Permanent { .. } => None,
        }
    }
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch one listing page; `None` for the first page.
    async fn fetch_posts(
        &self,
        subreddit: &str,
        cursor: Option<&Cursor>,
    ) -> Result<PostPage, FetchError>;

    /// Fetch a post and its whole comment tree.
    async fn fetch_thread(&self, post_id: &str) -> Result<Thread, FetchError>;

    async fn fetch_comments(&self, post_id: &str) -> Result<Vec<Comment>, FetchError> {
        Ok(self.fetch_thread(post_id).await?.comments)
    }
}

/// Lazy, restartable walk over a subreddit listing.
///
/// The cursor only advances after a page is fetched successfully, so a
/// pager that hit an error resumes from the page that failed.
pub struct ListingPager<'a> {
    source: &'a dyn ContentSource,
    subreddit: String,
    cursor: Option<Cursor>,
    max_pages: Option<usize>,
    pages_fetched: usize,
    exhausted: bool,
}

impl<'a> ListingPager<'a> {
    pub fn new(source: &'a dyn ContentSource, subreddit: impl Into<String>) -> Self {
        Self {
            source,
            subreddit: subreddit.into(),
            cursor: None,
            max_pages: None,
            pages_fetched: 0,
            exhausted: false,
        }
    }

    pub fn resume(
        source: &'a dyn ContentSource,
        subreddit: impl Into<String>,
        cursor: Cursor,
    ) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::new(source, subreddit)
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Where the next page would start; `None` before the first page or once exhausted.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Post>>, FetchError> {
        if self.exhausted {
            return Ok(None);
        }
        if self.max_pages.is_some_and(|max| self.pages_fetched >= max) {
            return Ok(None);
        }

        let page = self
            .source
            .fetch_posts(&self.subreddit, self.cursor.as_ref())
            .await?;
        self.pages_fetched += 1;
        self.exhausted = page.next_cursor.is_none();
        self.cursor = page.next_cursor;
        Ok(Some(page.posts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> FixtureSource {
        let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/reddit");
        FixtureSource::from_dir(root).expect("fixture dir")
    }

    #[tokio::test]
    async fn pager_walks_until_cursor_runs_out() {
        let source = fixtures();
        let mut pager = ListingPager::new(&source, "rust");
        let mut ids = Vec::new();
        while let Some(posts) = pager.next_page().await.expect("page") {
            ids.extend(posts.into_iter().map(|p| p.post_id));
        }
        assert_eq!(ids, vec!["p1", "p2", "p3"]);
        assert_eq!(pager.pages_fetched(), 2);
        assert!(pager.is_exhausted());
        assert!(pager.cursor().is_none());
    }

    #[tokio::test]
    async fn pager_resumes_from_saved_cursor() {
        let source = fixtures();
        let mut first = ListingPager::new(&source, "rust").with_max_pages(1);
        first.next_page().await.expect("page 1");
        assert!(first.next_page().await.expect("capped").is_none());
        let saved = first.cursor().cloned().expect("more pages");
        assert_eq!(saved.as_str(), "t3_p2");

        let mut resumed = ListingPager::resume(&source, "rust", saved);
        let posts = resumed.next_page().await.expect("page 2").expect("some");
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].post_id, "p3");
    }

    #[tokio::test]
    async fn pager_keeps_cursor_after_failure() {
        let source = FixtureSource::new();
        let mut pager = ListingPager::resume(&source, "rust", Cursor::new("t3_zz"));
        let err = pager.next_page().await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(pager.cursor().map(Cursor::as_str), Some("t3_zz"));
        assert_eq!(pager.pages_fetched(), 0);
    }

    #[tokio::test]
    async fn fetch_comments_defaults_to_thread_comments() {
        let source = fixtures();
        let comments = source.fetch_comments("p1").await.expect("comments");
        let thread = source.fetch_thread("p1").await.expect("thread");
        assert_eq!(comments, thread.comments);
    }

    #[test]
    fn retry_after_only_on_transient() {
        let transient = FetchError::Transient {
            target: "x".into(),
            reason: "429".into(),
            retry_after: Some(Duration::from_secs(4)),
        };
        assert_eq!(transient.retry_after(), Some(Duration::from_secs(4)));
        assert!(FetchError::permanent("x", "404").retry_after().is_none());
    }
}
