use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{query, Executor, Row, SqlitePool};

const MEMORY: &str = "sqlite::memory:";

/// The subset of Redis semantics the bridge relies on. Keys past their TTL
/// behave exactly like missing keys.
#[async_trait]
pub trait KeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    /// Atomic set-if-absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;
    async fn del(&self, key: &str) -> Result<bool>;
    /// `ttl` only applies when the counter is created by this call.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;
    async fn ping(&self) -> Result<()>;
}

pub struct SQLite {
    connection: SqlitePool,
}
impl SQLite {
    pub async fn new(db_conn: Option<String>) -> Result<Self> {
        let url = db_conn.unwrap_or_else(|| MEMORY.to_string());
        let options = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("invalid database url {}", url))?
            .create_if_missing(true);
        // every connection to an in-memory database sees its own empty database
        let connection = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options.journal_mode(SqliteJournalMode::Wal))
                .await?
        };
        connection
            .execute(
                "CREATE TABLE IF NOT EXISTS kv (\
                key TEXT PRIMARY KEY NOT NULL,\
                value TEXT NOT NULL,\
                expires_at INTEGER\
                )",
            )
            .await
            .context("couldn't create kv table")?;
        debug!("Opened key-value store at {}", url);
        Ok(Self { connection })
    }
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self
            .connection
            .execute(
                query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
                    .bind(Utc::now().timestamp_millis()),
            )
            .await?
            .rows_affected();
        Ok(purged)
    }
}
fn expiry(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| (Utc::now() + ttl).timestamp_millis())
}
#[async_trait]
impl KeyValueStore for SQLite {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = self
            .connection
            .fetch_optional(
                query(
                    "SELECT value FROM kv WHERE key = ? \
                AND (expires_at IS NULL OR expires_at > ?)",
                )
                .bind(key)
                .bind(Utc::now().timestamp_millis()),
            )
            .await
            .with_context(|| format!("couldn't get {}", key))?;
        Ok(row.map(|row| row.get("value")))
    }
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.connection
            .execute(
                query(
                    "INSERT INTO kv (key, value, expires_at) VALUES (?,?,?) \
                ON CONFLICT(key) DO UPDATE SET \
                value = excluded.value, \
                expires_at = excluded.expires_at",
                )
                .bind(key)
                .bind(value)
                .bind(expiry(ttl)),
            )
            .await
            .with_context(|| format!("couldn't set {}", key))?;
        Ok(())
    }
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let written = self
            .connection
            .execute(
                query(
                    "INSERT INTO kv (key, value, expires_at) VALUES (?,?,?) \
                ON CONFLICT(key) DO UPDATE SET \
                value = excluded.value, \
                expires_at = excluded.expires_at \
                WHERE kv.expires_at IS NOT NULL AND kv.expires_at <= ?",
                )
                .bind(key)
                .bind(value)
                .bind(expiry(ttl))
                .bind(Utc::now().timestamp_millis()),
            )
            .await
            .with_context(|| format!("couldn't set-if-absent {}", key))?
            .rows_affected();
        Ok(written == 1)
    }
    async fn del(&self, key: &str) -> Result<bool> {
        let deleted = self
            .connection
            .execute(
                query(
                    "DELETE FROM kv WHERE key = ? \
                AND (expires_at IS NULL OR expires_at > ?)",
                )
                .bind(key)
                .bind(Utc::now().timestamp_millis()),
            )
            .await
            .with_context(|| format!("couldn't delete {}", key))?
            .rows_affected();
        Ok(deleted > 0)
    }
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let row = self
            .connection
            .fetch_one(
                query(
                    "INSERT INTO kv (key, value, expires_at) VALUES (?, '1', ?) \
                ON CONFLICT(key) DO UPDATE SET \
                value = CASE WHEN kv.expires_at IS NOT NULL AND kv.expires_at <= ? \
                    THEN '1' \
                    ELSE CAST(CAST(kv.value AS INTEGER) + 1 AS TEXT) END, \
                expires_at = CASE WHEN kv.expires_at IS NOT NULL AND kv.expires_at <= ? \
                    THEN excluded.expires_at \
                    ELSE kv.expires_at END \
                RETURNING value",
                )
                .bind(key)
                .bind(expiry(ttl))
                .bind(now)
                .bind(now),
            )
            .await
            .with_context(|| format!("couldn't increment {}", key))?;
        let value: String = row.get("value");
        value
            .parse()
            .with_context(|| format!("{} holds non-integer value {}", key, value))
    }
    async fn ping(&self) -> Result<()> {
        self.connection.execute("SELECT 1").await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn set_get_and_delete() {
        let db = SQLite::new(None).await.unwrap();
        assert_eq!(db.get("a").await.unwrap(), None);
        db.set("a", "1", None).await.unwrap();
        db.set("a", "2", None).await.unwrap();
        assert_eq!(db.get("a").await.unwrap(), Some("2".to_string()));
        assert!(db.del("a").await.unwrap());
        assert!(!db.del("a").await.unwrap());
        assert_eq!(db.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_only_writes_absent_keys() {
        let db = SQLite::new(None).await.unwrap();
        assert!(db.set_nx("lock", "first", None).await.unwrap());
        assert!(!db.set_nx("lock", "second", None).await.unwrap());
        assert_eq!(db.get("lock").await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let db = SQLite::new(None).await.unwrap();
        db.set("gone", "x", Some(Duration::milliseconds(-1)))
            .await
            .unwrap();
        assert_eq!(db.get("gone").await.unwrap(), None);
        assert!(db.set_nx("gone", "y", Some(Duration::minutes(1))).await.unwrap());
        assert_eq!(db.get("gone").await.unwrap(), Some("y".to_string()));
        db.set("old", "x", Some(Duration::milliseconds(-1)))
            .await
            .unwrap();
        assert_eq!(db.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_counts_and_restarts_after_expiry() {
        let db = SQLite::new(None).await.unwrap();
        assert_eq!(db.incr("c", None).await.unwrap(), 1);
        assert_eq!(db.incr("c", None).await.unwrap(), 2);
        db.set("w", "41", Some(Duration::milliseconds(-1)))
            .await
            .unwrap();
        assert_eq!(db.incr("w", Some(Duration::minutes(1))).await.unwrap(), 1);
        assert_eq!(db.incr("w", Some(Duration::minutes(1))).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_set_nx_has_one_winner() {
        let db = std::sync::Arc::new(SQLite::new(None).await.unwrap());
        let attempts = (0..8).map(|i| {
            let db = db.clone();
            tokio::spawn(async move { db.set_nx("race", &i.to_string(), None).await.unwrap() })
        });
        let winners = futures_util::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|won| *won.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }
}
