//! OAuth Reddit client with a request limiter and failure classification.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use redcrawl_core::Cursor;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

use crate::listing::{parse_post_listing, parse_thread};
use crate::{ContentSource, FetchError, PostPage, Thread};

const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn request_error(target: &str, err: reqwest::Error) -> FetchError {
    match classify_reqwest_error(&err) {
        RetryDisposition::Retryable => FetchError::transient(target, err.to_string()),
        RetryDisposition::NonRetryable => FetchError::permanent(target, err.to_string()),
    }
}

/// Reddit reports the seconds until its rate-limit window resets.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    ["retry-after", "x-ratelimit-reset"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.trim().parse::<f64>().ok())
        .find(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn status_error(target: &str, status: StatusCode, headers: &HeaderMap) -> FetchError {
    match classify_status(status) {
        RetryDisposition::Retryable => FetchError::Transient {
            target: target.to_string(),
            reason: format!("http status {}", status.as_u16()),
            retry_after: retry_after(headers),
        },
        RetryDisposition::NonRetryable => {
            FetchError::permanent(target, format!("http status {}", status.as_u16()))
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedditCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone)]
pub struct RedditClientConfig {
    pub api_base: String,
    pub token_url: String,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub listing_limit: u32,
    /// Reply levels Reddit expands before cutting in `more` stubs.
    pub comment_depth: Option<u32>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for RedditClientConfig {
    fn default() -> Self {
        Self {
            api_base: "https://oauth.reddit.com".to_string(),
            token_url: "https://www.reddit.com/api/v1/access_token".to_string(),
            timeout: Duration::from_secs(20),
            max_concurrency: 4,
            listing_limit: 100,
            comment_depth: Some(32),
            // OAuth clients get 100 requests per minute.
            token_bucket: Some(TokenBucketConfig {
                capacity: 10,
                refill_every: Duration::from_millis(600),
            }),
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(BucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.max(Duration::from_millis(1));
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Production [`ContentSource`] against Reddit's OAuth API.
#[derive(Debug)]
pub struct RedditSource {
    http: reqwest::Client,
    credentials: RedditCredentials,
    config: RedditClientConfig,
    limit: Arc<Semaphore>,
    bucket: Option<Arc<TokenBucket>>,
    token: Mutex<Option<AccessToken>>,
}

impl RedditSource {
    pub fn new(credentials: RedditCredentials, config: RedditClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(credentials.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            http,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            bucket: config.token_bucket.map(|c| Arc::new(TokenBucket::new(c))),
            token: Mutex::new(None),
            credentials,
            config,
        })
    }

    async fn access_token(&self, force_refresh: bool) -> Result<String, FetchError> {
        let mut slot = self.token.lock().await;
        if !force_refresh {
            if let Some(token) = slot.as_ref() {
                if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                    return Ok(token.value.clone());
                }
            }
        }

        let fresh = self.request_token().await?;
        let value = fresh.value.clone();
        *slot = Some(fresh);
        Ok(value)
    }

    async fn request_token(&self) -> Result<AccessToken, FetchError> {
        let target = self.config.token_url.as_str();
        let form: Vec<(&str, &str)> = match (&self.credentials.username, &self.credentials.password) {
            (Some(username), Some(password)) => vec![
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ],
            _ => vec![("grant_type", "client_credentials")],
        };

        let resp = self
            .http
            .post(target)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| request_error(target, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(target, status, resp.headers()));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| FetchError::permanent(target, format!("token response: {e}")))?;
        debug!(expires_in = body.expires_in, "obtained reddit access token");

        Ok(AccessToken {
            value: body.access_token,
            expires_at: Instant::now() + Duration::from_secs(body.expires_in),
        })
    }

    async fn get_bytes(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<u8>, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| FetchError::transient(path, "request limiter closed"))?;
        if let Some(bucket) = &self.bucket {
            bucket.take().await;
        }

        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path);
        let mut refreshed = false;
        loop {
            let token = self.access_token(refreshed).await?;
            let resp = self
                .http
                .get(&url)
                .header(AUTHORIZATION, format!("bearer {token}"))
                .query(query)
                .send()
                .await
                .map_err(|e| request_error(path, e))?;

            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                warn!(path, "access token rejected; refreshing once");
                refreshed = true;
                continue;
            }
            if !status.is_success() {
                if status == StatusCode::TOO_MANY_REQUESTS {
                    warn!(path, "rate limit reached (429)");
                }
                return Err(status_error(path, status, resp.headers()));
            }

            debug!(path, status = status.as_u16(), "fetched");
            let body = resp.bytes().await.map_err(|e| request_error(path, e))?;
            return Ok(body.to_vec());
        }
    }
}

#[async_trait]
impl ContentSource for RedditSource {
    async fn fetch_posts(
        &self,
        subreddit: &str,
        cursor: Option<&Cursor>,
    ) -> Result<PostPage, FetchError> {
        let path = format!("/r/{subreddit}/new");
        let mut query = vec![
            ("limit", self.config.listing_limit.to_string()),
            ("raw_json", "1".to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("after", cursor.as_str().to_string()));
        }

        let span = info_span!("http_fetch", subreddit, after = cursor.map(Cursor::as_str));
        let body = self.get_bytes(&path, &query).instrument(span).await?;
        parse_post_listing(subreddit, &body).map_err(|e| e.into_fetch_error(&path))
    }

    async fn fetch_thread(&self, post_id: &str) -> Result<Thread, FetchError> {
        let path = format!("/comments/{post_id}");
        let mut query = vec![("raw_json", "1".to_string())];
        if let Some(depth) = self.config.comment_depth {
            query.push(("depth", depth.to_string()));
        }
        let span = info_span!("http_fetch", post_id);
        let body = self.get_bytes(&path, &query).instrument(span).await?;
        parse_thread(post_id, &body).map_err(|e| e.into_fetch_error(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
    }

    #[test]
    fn status_errors_carry_the_reset_window() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("42"));
        let err = status_error("/r/rust/new", StatusCode::TOO_MANY_REQUESTS, &headers);
        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(42)));

        let gone = status_error("/comments/x", StatusCode::NOT_FOUND, &headers);
        assert!(!gone.is_transient());
    }

    #[test]
    fn default_config_targets_oauth_api() {
        let config = RedditClientConfig::default();
        assert_eq!(config.api_base, "https://oauth.reddit.com");
        assert_eq!(config.listing_limit, 100);
        let depth = config.comment_depth.expect("bounded comment depth") as usize;
        assert!(depth * 5 < crate::listing::MAX_THREAD_NESTING);
        assert!(config.token_bucket.is_some());
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_then_waits() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::from_millis(20),
        });
        let started = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(started.elapsed() < Duration::from_millis(20));
        bucket.take().await;
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        let source = RedditSource::new(
            RedditCredentials {
                client_id: "id".into(),
                client_secret: "secret".into(),
                user_agent: "redcrawl-test/0.1".into(),
                username: None,
                password: None,
            },
            RedditClientConfig {
                api_base: "http://127.0.0.1:9".into(),
                token_url: "http://127.0.0.1:9/api/v1/access_token".into(),
                timeout: Duration::from_secs(2),
                token_bucket: None,
                ..Default::default()
            },
        )
        .expect("client");

        let err = source.fetch_thread("p1").await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
