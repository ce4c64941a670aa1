//! Core domain model for redcrawl: posts, comments and their stored rows.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "redcrawl-core";

/// Full source document of a record, kept as a JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn i64_field(&self, key: &str) -> Option<i64> {
        let value = self.0.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f as i64))
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Payload {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}

/// Opaque pagination token handed back by a listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A post as normalized from the content source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub post_id: String,
    pub subreddit: String,
    pub title: String,
    pub author: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub score: i64,
    pub data: Payload,
}

/// A comment as normalized from the content source.
///
/// `parent_id` is the bare id of either the post or another comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub comment_id: String,
    pub post_id: String,
    pub parent_id: String,
    pub author: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub score: i64,
    pub body: String,
    pub data: Payload,
}

/// Persisted post row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPost {
    pub post: Post,
    pub last_updated: DateTime<Utc>,
    pub crawled_at: DateTime<Utc>,
}

/// Persisted comment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredComment {
    pub comment: Comment,
    pub last_updated: DateTime<Utc>,
    pub crawled_at: DateTime<Utc>,
}

/// Strip a Reddit kind prefix (`t1_`, `t3_`, ...) from a fullname.
pub fn strip_fullname(fullname: &str) -> &str {
    match fullname.split_once('_') {
        Some((kind, id))
            if kind.len() == 2 && kind.starts_with('t') && kind[1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            id
        }
        _ => fullname,
    }
}

/// Reddit encodes timestamps as float seconds since the epoch.
pub fn utc_from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1_000_000_000.0).round() as u32;
    Utc.timestamp_opt(whole, nanos.min(999_999_999)).single()
}

/// Time source shared by the enqueuer and the in-memory store.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fullname_prefix_is_stripped_only_for_kinds() {
        assert_eq!(strip_fullname("t1_abc"), "abc");
        assert_eq!(strip_fullname("t3_xyz"), "xyz");
        assert_eq!(strip_fullname("abc"), "abc");
        assert_eq!(strip_fullname("foo_bar"), "foo_bar");
    }

    #[test]
    fn payload_accessors_read_typed_fields() {
        let payload = Payload::try_from(json!({
            "title": "hello",
            "score": 12,
            "ups": 3.0,
            "created_utc": 1700000000.5
        }))
        .expect("object payload");

        assert_eq!(payload.str_field("title"), Some("hello"));
        assert_eq!(payload.i64_field("score"), Some(12));
        assert_eq!(payload.i64_field("ups"), Some(3));
        assert_eq!(payload.f64_field("created_utc"), Some(1700000000.5));
        assert_eq!(payload.str_field("missing"), None);
        assert!(Payload::try_from(json!([1, 2])).is_err());
    }

    #[test]
    fn epoch_seconds_convert_with_fraction() {
        let ts = utc_from_epoch_seconds(1700000000.25).expect("valid");
        assert_eq!(ts.timestamp(), 1700000000);
        assert_eq!(ts.timestamp_subsec_millis(), 250);
        assert!(utc_from_epoch_seconds(f64::NAN).is_none());
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start + Duration::minutes(5));
    }
}
