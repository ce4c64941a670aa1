//! Normalization of Reddit listing documents into posts and comments.

use redcrawl_core::{strip_fullname, utc_from_epoch_seconds, Comment, Cursor, Payload, Post};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::{FetchError, PostPage, Thread};

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid listing json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} is missing field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
    #[error("thread document has no post")]
    EmptyThread,
    #[error("thread document should be a [post, comments] pair")]
    NotAThread,
    #[error("thread document nests {depth} levels deep (limit {limit})")]
    TooDeep { depth: usize, limit: usize },
}

/// JSON nesting accepted for a thread document. Each reply level costs about
/// five levels, so this admits reply chains around a hundred deep.
pub const MAX_THREAD_NESTING: usize = 512;

impl ListingError {
    pub(crate) fn into_fetch_error(self, target: &str) -> FetchError {
        FetchError::permanent(target, self.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    children: Vec<Thing>,
}

#[derive(Debug, Deserialize)]
struct Thing {
    kind: String,
    data: Map<String, Value>,
}

fn required_str(
    data: &Map<String, Value>,
    kind: &'static str,
    field: &'static str,
) -> Result<String, ListingError> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ListingError::MissingField { kind, field })
}

fn optional_str(data: &Map<String, Value>, field: &str) -> Option<String> {
    data.get(field).and_then(Value::as_str).map(str::to_string)
}

fn score(data: &Map<String, Value>) -> i64 {
    let Some(value) = data.get("score") else {
        return 0;
    };
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or(0)
}

fn created_utc(
    data: &Map<String, Value>,
    kind: &'static str,
) -> Result<chrono::DateTime<chrono::Utc>, ListingError> {
    data.get("created_utc")
        .and_then(Value::as_f64)
        .and_then(utc_from_epoch_seconds)
        .ok_or(ListingError::MissingField {
            kind,
            field: "created_utc",
        })
}

fn post_from_data(subreddit_hint: &str, data: Map<String, Value>) -> Result<Post, ListingError> {
    let post_id = required_str(&data, "post", "id")?;
    let subreddit = optional_str(&data, "subreddit").unwrap_or_else(|| subreddit_hint.to_string());
    Ok(Post {
        post_id,
        subreddit,
        title: required_str(&data, "post", "title")?,
        author: optional_str(&data, "author"),
        created_utc: created_utc(&data, "post")?,
        score: score(&data),
        data: Payload::from(data),
    })
}

/// Parse a `/r/{sub}/new` listing page.
pub fn parse_post_listing(subreddit: &str, body: &[u8]) -> Result<PostPage, ListingError> {
    let listing: Listing = serde_json::from_slice(body)?;
    let mut posts = Vec::with_capacity(listing.data.children.len());
    for thing in listing.data.children {
        if thing.kind != "t3" {
            continue;
        }
        posts.push(post_from_data(subreddit, thing.data)?);
    }
    let next_cursor = listing
        .data
        .after
        .filter(|after| !after.is_empty())
        .map(Cursor::new);
    Ok(PostPage { posts, next_cursor })
}

/// Deepest array/object nesting in a JSON document, ignoring brackets
/// inside strings.
fn nesting_depth(body: &[u8]) -> usize {
    let (mut depth, mut max) = (0usize, 0usize);
    let (mut in_string, mut escaped) = (false, false);
    for &byte in body {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                max = max.max(depth);
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// Comment trees outgrow serde_json's default recursion limit, so the limit
/// is replaced by an upfront nesting check.
fn parse_deep_value(body: &[u8]) -> Result<Value, ListingError> {
    let depth = nesting_depth(body);
    if depth > MAX_THREAD_NESTING {
        return Err(ListingError::TooDeep {
            depth,
            limit: MAX_THREAD_NESTING,
        });
    }
    let mut de = serde_json::Deserializer::from_slice(body);
    de.disable_recursion_limit();
    let value = Value::deserialize(&mut de)?;
    de.end()?;
    Ok(value)
}

/// Parse a `/comments/{id}` document: `[post listing, comment listing]`.
pub fn parse_thread(post_id: &str, body: &[u8]) -> Result<Thread, ListingError> {
    let mut pair: Vec<Listing> = match parse_deep_value(body)? {
        Value::Array(items) if items.len() == 2 => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?,
        _ => return Err(ListingError::NotAThread),
    };
    let comments_listing = pair.pop().ok_or(ListingError::NotAThread)?;
    let post_listing = pair.pop().ok_or(ListingError::NotAThread)?;

    let post_thing = post_listing
        .data
        .children
        .into_iter()
        .find(|thing| thing.kind == "t3")
        .ok_or(ListingError::EmptyThread)?;
    let post = post_from_data("", post_thing.data)?;

    let mut comments = Vec::new();
    let mut skipped_more = 0usize;
    let link_post_id = if post.post_id.is_empty() {
        post_id.to_string()
    } else {
        post.post_id.clone()
    };
    collect_comments(
        comments_listing.data.children,
        &link_post_id,
        &mut comments,
        &mut skipped_more,
    )?;
    if skipped_more > 0 {
        debug!(post_id, skipped_more, "thread has unexpanded `more` placeholders");
    }

    Ok(Thread { post, comments })
}

fn collect_comments(
    children: Vec<Thing>,
    post_id: &str,
    out: &mut Vec<Comment>,
    skipped_more: &mut usize,
) -> Result<(), ListingError> {
    for thing in children {
        match thing.kind.as_str() {
            "t1" => {
                let mut data = thing.data;
                let replies = data.remove("replies");
                out.push(comment_from_data(post_id, data)?);
                if let Some(Value::Object(replies)) = replies {
                    let listing: Listing = serde_json::from_value(Value::Object(replies))?;
                    collect_comments(listing.data.children, post_id, out, skipped_more)?;
                }
            }
            "more" => *skipped_more += 1,
            _ => {}
        }
    }
    Ok(())
}

fn comment_from_data(post_id: &str, data: Map<String, Value>) -> Result<Comment, ListingError> {
    let comment_id = required_str(&data, "comment", "id")?;
    let parent_id = required_str(&data, "comment", "parent_id")?;
    Ok(Comment {
        comment_id,
        post_id: post_id.to_string(),
        parent_id: strip_fullname(&parent_id).to_string(),
        author: optional_str(&data, "author"),
        created_utc: created_utc(&data, "comment")?,
        score: score(&data),
        body: optional_str(&data, "body").unwrap_or_default(),
        data: Payload::from(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = include_str!("../../../fixtures/reddit/r/rust/first.json");
    const THREAD: &str = include_str!("../../../fixtures/reddit/comments/p1.json");

    #[test]
    fn listing_page_yields_posts_and_cursor() {
        let page = parse_post_listing("rust", LISTING.as_bytes()).expect("listing");
        assert_eq!(page.posts.len(), 2);
        assert_eq!(page.posts[0].post_id, "p1");
        assert_eq!(page.posts[0].subreddit, "rust");
        assert_eq!(page.posts[0].score, 42);
        assert_eq!(page.posts[0].data.str_field("permalink"), Some("/r/rust/comments/p1/"));
        assert_eq!(page.next_cursor, Some(Cursor::new("t3_p2")));
    }

    #[test]
    fn thread_is_flattened_parent_first_with_bare_parent_ids() {
        let thread = parse_thread("p1", THREAD.as_bytes()).expect("thread");
        assert_eq!(thread.post.post_id, "p1");

        let ids = thread
            .comments
            .iter()
            .map(|c| (c.comment_id.as_str(), c.parent_id.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![("c1", "p1"), ("c2", "c1"), ("c3", "p1")]);
        assert!(thread.comments.iter().all(|c| c.post_id == "p1"));
        assert!(thread.comments[0].data.get("replies").is_none());
    }

    #[test]
    fn deleted_author_is_kept_as_given() {
        let thread = parse_thread("p1", THREAD.as_bytes()).expect("thread");
        let c3 = thread.comments.iter().find(|c| c.comment_id == "c3").unwrap();
        assert_eq!(c3.author.as_deref(), Some("[deleted]"));
        assert_eq!(c3.body, "[removed]");
    }

    #[test]
    fn empty_post_listing_is_an_empty_thread() {
        let body = br#"[{"kind":"Listing","data":{"children":[]}},{"kind":"Listing","data":{"children":[]}}]"#;
        assert!(matches!(parse_thread("gone", body), Err(ListingError::EmptyThread)));
        assert!(matches!(parse_thread("gone", b"{}"), Err(ListingError::NotAThread)));
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let body = br#"{"kind":"Listing","data":{"after":null,"children":[{"kind":"t3","data":{"id":"x"}}]}}"#;
        let err = parse_post_listing("rust", body).unwrap_err();
        assert!(matches!(
            err,
            ListingError::MissingField { kind: "post", field: "title" }
        ));
        assert!(!err.into_fetch_error("r/rust").is_transient());
    }

    /// A thread whose comments form one reply chain `depth` long.
    fn reply_chain(depth: usize) -> String {
        let mut replies = r#""""#.to_string();
        for i in (0..depth).rev() {
            let parent = if i == 0 {
                "t3_p1".to_string()
            } else {
                format!("t1_c{}", i - 1)
            };
            replies = format!(
                r#"{{"kind":"Listing","data":{{"children":[{{"kind":"t1","data":{{"id":"c{i}","parent_id":"{parent}","body":"x","created_utc":1.0,"replies":{replies}}}}}]}}}}"#
            );
        }
        format!(
            r#"[{{"kind":"Listing","data":{{"children":[{{"kind":"t3","data":{{"id":"p1","subreddit":"rust","title":"t","created_utc":1.0,"score":1}}}}]}}}},{replies}]"#
        )
    }

    #[test]
    fn long_reply_chains_are_kept_whole() {
        let thread = parse_thread("p1", reply_chain(60).as_bytes()).expect("deep thread");
        assert_eq!(thread.comments.len(), 60);
        assert_eq!(thread.comments[0].parent_id, "p1");
        assert_eq!(thread.comments[59].parent_id, "c58");
    }

    #[test]
    fn absurd_nesting_is_rejected_before_parsing() {
        let err = parse_thread("p1", reply_chain(200).as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ListingError::TooDeep { limit: MAX_THREAD_NESTING, .. }
        ));
    }

    #[test]
    fn brackets_inside_strings_do_not_count_as_nesting() {
        assert_eq!(nesting_depth(br#"{"body":"[[[{{ \"]"}"#), 1);
        assert_eq!(nesting_depth(br#"[{"a":[1,{"b":[]}]}]"#), 5);
        assert_eq!(nesting_depth(b"3"), 0);
    }
}
