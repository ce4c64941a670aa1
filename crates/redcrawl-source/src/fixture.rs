use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redcrawl_core::Cursor;

use crate::listing::{parse_post_listing, parse_thread};
use crate::{ContentSource, FetchError, PostPage, Thread};

const FIRST_PAGE: &str = "first";

/// [`ContentSource`] serving captured Reddit documents instead of the network.
///
/// Directory layout: `r/<subreddit>/<cursor or "first">.json` for listing
/// pages and `comments/<post_id>.json` for threads.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    listings: HashMap<(String, String), Vec<u8>>,
    threads: HashMap<String, Vec<u8>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut source = Self::new();

        let listings_root = root.join("r");
        if listings_root.is_dir() {
            for sub_entry in fs::read_dir(&listings_root)
                .with_context(|| format!("reading {}", listings_root.display()))?
            {
                let sub_entry = sub_entry?;
                if !sub_entry.file_type()?.is_dir() {
                    continue;
                }
                let subreddit = sub_entry.file_name().to_string_lossy().to_string();
                for page in json_files(&sub_entry.path())? {
                    let (stem, body) = page;
                    source.listings.insert((subreddit.clone(), stem), body);
                }
            }
        }

        let threads_root = root.join("comments");
        if threads_root.is_dir() {
            for (post_id, body) in json_files(&threads_root)? {
                source.threads.insert(post_id, body);
            }
        }

        Ok(source)
    }

    pub fn with_listing_page(
        mut self,
        subreddit: &str,
        cursor: Option<&str>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let key = cursor.unwrap_or(FIRST_PAGE).to_string();
        self.listings
            .insert((subreddit.to_string(), key), body.into());
        self
    }

    pub fn with_thread(mut self, post_id: &str, body: impl Into<Vec<u8>>) -> Self {
        self.threads.insert(post_id.to_string(), body.into());
        self
    }
}

fn json_files(dir: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let body = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        files.push((stem.to_string(), body));
    }
    Ok(files)
}

#[async_trait]
impl ContentSource for FixtureSource {
    async fn fetch_posts(
        &self,
        subreddit: &str,
        cursor: Option<&Cursor>,
    ) -> Result<PostPage, FetchError> {
        let page = cursor.map(Cursor::as_str).unwrap_or(FIRST_PAGE);
        let target = format!("r/{subreddit}?after={page}");
        let body = self
            .listings
            .get(&(subreddit.to_string(), page.to_string()))
            .ok_or_else(|| FetchError::permanent(&target, "no fixture page (404)"))?;
        parse_post_listing(subreddit, body).map_err(|e| e.into_fetch_error(&target))
    }

    async fn fetch_thread(&self, post_id: &str) -> Result<Thread, FetchError> {
        let target = format!("comments/{post_id}");
        let body = self
            .threads
            .get(post_id)
            .ok_or_else(|| FetchError::permanent(&target, "no fixture thread (404)"))?;
        parse_thread(post_id, body).map_err(|e| e.into_fetch_error(&target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn loads_pages_and_threads_from_directory() {
        let dir = tempdir().expect("tempdir");
        let sub_dir = dir.path().join("r").join("golang");
        let comments_dir = dir.path().join("comments");
        fs::create_dir_all(&sub_dir).unwrap();
        fs::create_dir_all(&comments_dir).unwrap();
        fs::write(
            sub_dir.join("first.json"),
            br#"{"kind":"Listing","data":{"after":null,"children":[
                {"kind":"t3","data":{"id":"g1","title":"gophers","created_utc":1.0,"score":3}}]}}"#,
        )
        .unwrap();
        fs::write(sub_dir.join("notes.txt"), b"ignored").unwrap();
        fs::write(
            comments_dir.join("g1.json"),
            br#"[{"kind":"Listing","data":{"children":[
                {"kind":"t3","data":{"id":"g1","subreddit":"golang","title":"gophers","created_utc":1.0}}]}},
                {"kind":"Listing","data":{"children":[]}}]"#,
        )
        .unwrap();

        let source = FixtureSource::from_dir(dir.path()).expect("load");
        let page = source.fetch_posts("golang", None).await.expect("page");
        assert_eq!(page.posts[0].post_id, "g1");
        assert_eq!(page.posts[0].subreddit, "golang");
        assert!(page.next_cursor.is_none());

        let thread = source.fetch_thread("g1").await.expect("thread");
        assert!(thread.comments.is_empty());
    }

    #[tokio::test]
    async fn unknown_thread_is_permanent() {
        let source = FixtureSource::new();
        let err = source.fetch_thread("nope").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn malformed_fixture_is_permanent() {
        let source = FixtureSource::new().with_thread("bad", "not json");
        let err = source.fetch_thread("bad").await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent { .. }));
    }
}
