use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redcrawl_core::{Comment, Payload, Post, StoredComment, StoredPost};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::debug;

use crate::{validate_comment, validate_post, PersistenceError, RecordStore, StoreCounts};

/// Schema for `reddit_posts`, `reddit_comments` and the `crawl_jobs` queue.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const POST_COLUMNS: &str =
    "post_id, subreddit, title, author, created_utc, score, data, last_updated, crawled_at";
const COMMENT_COLUMNS: &str = "comment_id, post_id, parent_id, author, created_utc, score, body, data, last_updated, crawled_at";

/// Postgres-backed [`RecordStore`] over the `reddit_posts` / `reddit_comments` tables.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map a driver error onto the persistence taxonomy.
pub fn classify_sqlx_error(err: sqlx::Error) -> PersistenceError {
    match err {
        sqlx::Error::Database(db) => {
            let is_integrity = db.code().is_some_and(|code| code.starts_with("23"));
            if is_integrity {
                PersistenceError::Constraint(db.message().to_string())
            } else {
                PersistenceError::Unavailable(db.message().to_string())
            }
        }
        sqlx::Error::RowNotFound
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnIndexOutOfBounds { .. }
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Decode(_) => PersistenceError::Decode(err.to_string()),
        other => PersistenceError::Unavailable(other.to_string()),
    }
}

// Timestamps come from clock_timestamp(), not the transaction start time, so
// the writer that takes the row lock last also writes the latest last_updated.
fn upsert_post_sql() -> String {
    format!(
        r#"
        INSERT INTO reddit_posts
            (post_id, subreddit, title, author, created_utc, score, data, last_updated, crawled_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, clock_timestamp(), clock_timestamp())
        ON CONFLICT (post_id) DO UPDATE
        SET title = EXCLUDED.title,
            author = EXCLUDED.author,
            score = EXCLUDED.score,
            data = EXCLUDED.data,
            last_updated = clock_timestamp()
        RETURNING {POST_COLUMNS}
        "#
    )
}

fn upsert_comment_sql() -> String {
    format!(
        r#"
        INSERT INTO reddit_comments
            (comment_id, post_id, parent_id, author, created_utc, score, body, data, last_updated, crawled_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, clock_timestamp(), clock_timestamp())
        ON CONFLICT (comment_id) DO UPDATE
        SET author = EXCLUDED.author,
            score = EXCLUDED.score,
            body = EXCLUDED.body,
            data = EXCLUDED.data,
            last_updated = clock_timestamp()
        RETURNING {COMMENT_COLUMNS}
        "#
    )
}

fn post_from_row(row: &PgRow) -> Result<StoredPost, sqlx::Error> {
    let Json(data): Json<Payload> = row.try_get("data")?;
    Ok(StoredPost {
        post: Post {
            post_id: row.try_get("post_id")?,
            subreddit: row.try_get("subreddit")?,
            title: row.try_get("title")?,
            author: row.try_get("author")?,
            created_utc: row.try_get("created_utc")?,
            score: row.try_get("score")?,
            data,
        },
        last_updated: row.try_get("last_updated")?,
        crawled_at: row.try_get("crawled_at")?,
    })
}

fn comment_from_row(row: &PgRow) -> Result<StoredComment, sqlx::Error> {
    let Json(data): Json<Payload> = row.try_get("data")?;
    Ok(StoredComment {
        comment: Comment {
            comment_id: row.try_get("comment_id")?,
            post_id: row.try_get("post_id")?,
            parent_id: row.try_get("parent_id")?,
            author: row.try_get("author")?,
            created_utc: row.try_get("created_utc")?,
            score: row.try_get("score")?,
            body: row.try_get("body")?,
            data,
        },
        last_updated: row.try_get("last_updated")?,
        crawled_at: row.try_get("crawled_at")?,
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert_post(&self, post: &Post) -> Result<StoredPost, PersistenceError> {
        validate_post(post)?;
        let row = sqlx::query(&upsert_post_sql())
            .bind(&post.post_id)
            .bind(&post.subreddit)
            .bind(&post.title)
            .bind(&post.author)
            .bind(post.created_utc)
            .bind(post.score)
            .bind(Json(&post.data))
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        let stored = post_from_row(&row).map_err(classify_sqlx_error)?;
        debug!(post_id = %stored.post.post_id, "upserted post");
        Ok(stored)
    }

    async fn upsert_comment(&self, comment: &Comment) -> Result<StoredComment, PersistenceError> {
        validate_comment(comment)?;
        let row = sqlx::query(&upsert_comment_sql())
            .bind(&comment.comment_id)
            .bind(&comment.post_id)
            .bind(&comment.parent_id)
            .bind(&comment.author)
            .bind(comment.created_utc)
            .bind(comment.score)
            .bind(&comment.body)
            .bind(Json(&comment.data))
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        comment_from_row(&row).map_err(classify_sqlx_error)
    }

    async fn post_last_updated(
        &self,
        post_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_updated FROM reddit_posts WHERE post_id = $1",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)
    }

    async fn get_post(&self, post_id: &str) -> Result<Option<StoredPost>, PersistenceError> {
        let sql = format!("SELECT {POST_COLUMNS} FROM reddit_posts WHERE post_id = $1");
        let row = sqlx::query(&sql)
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        row.as_ref()
            .map(post_from_row)
            .transpose()
            .map_err(classify_sqlx_error)
    }

    async fn get_comment(
        &self,
        comment_id: &str,
    ) -> Result<Option<StoredComment>, PersistenceError> {
        let sql = format!("SELECT {COMMENT_COLUMNS} FROM reddit_comments WHERE comment_id = $1");
        let row = sqlx::query(&sql)
            .bind(comment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        row.as_ref()
            .map(comment_from_row)
            .transpose()
            .map_err(classify_sqlx_error)
    }

    async fn comments_for_post(
        &self,
        post_id: &str,
    ) -> Result<Vec<StoredComment>, PersistenceError> {
        let sql = format!(
            "SELECT {COMMENT_COLUMNS} FROM reddit_comments WHERE post_id = $1 ORDER BY created_utc, comment_id"
        );
        let rows = sqlx::query(&sql)
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        rows.iter()
            .map(comment_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify_sqlx_error)
    }

    async fn counts(&self) -> Result<StoreCounts, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM reddit_posts) AS posts,
                   (SELECT COUNT(*) FROM reddit_comments) AS comments
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        let posts: i64 = row.try_get("posts").map_err(classify_sqlx_error)?;
        let comments: i64 = row.try_get("comments").map_err(classify_sqlx_error)?;
        Ok(StoreCounts {
            posts: posts.max(0) as u64,
            comments: comments.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_failures_are_unavailable() {
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::PoolTimedOut),
            PersistenceError::Unavailable(_)
        ));
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::PoolClosed),
            PersistenceError::Unavailable(_)
        ));
    }

    #[test]
    fn missing_rows_and_columns_are_decode_errors() {
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::RowNotFound),
            PersistenceError::Decode(_)
        ));
        assert!(matches!(
            classify_sqlx_error(sqlx::Error::ColumnNotFound("score".into())),
            PersistenceError::Decode(_)
        ));
    }

    #[test]
    fn upserts_stamp_rows_at_write_time() {
        for sql in [upsert_post_sql(), upsert_comment_sql()] {
            assert!(!sql.contains("NOW()"));
            assert_eq!(sql.matches("clock_timestamp()").count(), 3);
            let update_arm = sql.split("DO UPDATE").nth(1).expect("update arm");
            assert!(!update_arm.contains("crawled_at ="));
        }
    }

    #[test]
    fn migrations_ship_both_tables_and_the_queue() {
        let descriptions = MIGRATOR
            .iter()
            .map(|m| m.description.to_string())
            .collect::<Vec<_>>();
        assert!(descriptions.iter().any(|d| d.contains("reddit")));
        assert!(descriptions.iter().any(|d| d.contains("crawl jobs")));
        assert!(MIGRATOR.iter().all(|m| !m.sql.is_empty()));
    }
}
