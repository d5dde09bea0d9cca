//! Persisted key-value store for controller state.
//!
//! Everything that must survive a restart lives here: per-zone state and
//! VWC, plus the two daily sentinels. The production store is a single
//! SQLite table in WAL mode; every operation runs under a bounded retry to
//! absorb transient lock contention, and a WAL checkpoint runs at most once
//! per [`COMPACTION_INTERVAL`].

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Minimum spacing between WAL checkpoints.
pub const COMPACTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Every key the controller writes. `Display` is the single source of truth
/// for the on-disk key layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    /// Date of the last completed daily pass.
    LastRunDate,
    /// Date of the last Complete→Idle zone reset.
    LastZoneResetDate,
    ZoneState(u32),
    ZoneVwc(u32),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::LastRunDate => write!(f, "last_run_date"),
            Key::LastZoneResetDate => write!(f, "last_zone_reset_date"),
            Key::ZoneState(n) => write!(f, "zone/{n}/state"),
            Key::ZoneVwc(n) => write!(f, "zone/{n}/vwc"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum KvError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("kv {op} '{key}' failed after {attempts} attempts: {message}")]
    Exhausted {
        op: &'static str,
        key: String,
        attempts: u32,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Durable string→string map. Implementations must be linearizable for a
/// single controller process.
pub trait KvStore: Clone + Send + Sync + 'static {
    /// `Ok(None)` when the key has never been written.
    fn get(&self, key: &Key) -> impl Future<Output = Result<Option<String>, KvError>> + Send;

    fn set(&self, key: &Key, value: &str) -> impl Future<Output = Result<(), KvError>> + Send;

    /// Write every entry or none of them.
    fn set_all(
        &self,
        entries: &[(Key, String)],
    ) -> impl Future<Output = Result<(), KvError>> + Send;
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(60))
    }
}

/// Run `f` until it succeeds or `policy.attempts` is exhausted, sleeping
/// `policy.interval` between attempts.
pub async fn with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    op: &'static str,
    key: &str,
    mut f: F,
) -> Result<T, KvError>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= policy.attempts => {
                return Err(KvError::Exhausted {
                    op,
                    key: key.to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(op, key, attempt, "kv: {e}, retrying");
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteKv {
    pool: Pool<Sqlite>,
    retry: RetryPolicy,
    last_compaction: Arc<Mutex<Instant>>,
}

impl SqliteKv {
    /// db_url examples:
    /// - "sqlite:/var/lib/irctl/irctl.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str, retry: RetryPolicy) -> Result<Self, KvError> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| KvError::Open(format!("invalid sqlite connection string {db_url}: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        // An in-memory database exists per connection, so keep exactly one.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| KvError::Open(format!("failed to connect to {db_url}: {e}")))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| KvError::Open(format!("failed to run migrations: {e}")))?;

        let kv = Self {
            pool,
            retry,
            last_compaction: Arc::new(Mutex::new(Instant::now())),
        };
        kv.compact().await;
        info!(db_url, "kv store ready");
        Ok(kv)
    }

    async fn get_once(&self, key: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
    }

    async fn set_once(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_all_once(&self, entries: &[(String, String)]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in entries {
            sqlx::query(
                "INSERT INTO kv (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Checkpoint and truncate the WAL. Failures are logged, never returned.
    pub async fn compact(&self) {
        match sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
        {
            Ok(_) => debug!("kv: wal checkpoint complete"),
            Err(e) => warn!("kv: wal checkpoint failed: {e}"),
        }
    }

    /// Compact if the last compaction is older than [`COMPACTION_INTERVAL`].
    async fn maybe_compact(&self) {
        let due = {
            let mut last = self
                .last_compaction
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() >= COMPACTION_INTERVAL {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            self.compact().await;
        }
    }
}

impl KvStore for SqliteKv {
    async fn get(&self, key: &Key) -> Result<Option<String>, KvError> {
        let key = key.to_string();
        // A missing row is Ok(None) on the first attempt and never retried.
        with_retry(self.retry, "get", &key, || self.get_once(&key)).await
    }

    async fn set(&self, key: &Key, value: &str) -> Result<(), KvError> {
        let key = key.to_string();
        with_retry(self.retry, "set", &key, || self.set_once(&key, value)).await?;
        self.maybe_compact().await;
        Ok(())
    }

    async fn set_all(&self, entries: &[(Key, String)]) -> Result<(), KvError> {
        let entries: Vec<(String, String)> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let label = entries
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(",");
        with_retry(self.retry, "set_all", &label, || self.set_all_once(&entries)).await?;
        self.maybe_compact().await;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    async fn memory_kv() -> SqliteKv {
        SqliteKv::connect("sqlite::memory:", fast_retry()).await.unwrap()
    }

    // -- Keys ---------------------------------------------------------------

    #[test]
    fn key_layout() {
        assert_eq!(Key::LastRunDate.to_string(), "last_run_date");
        assert_eq!(Key::LastZoneResetDate.to_string(), "last_zone_reset_date");
        assert_eq!(Key::ZoneState(3).to_string(), "zone/3/state");
        assert_eq!(Key::ZoneVwc(12).to_string(), "zone/12/vwc");
    }

    #[test]
    fn zone_keys_do_not_collide_across_digits() {
        assert_ne!(Key::ZoneState(1).to_string(), Key::ZoneState(11).to_string());
        assert!(!Key::ZoneState(11).to_string().starts_with(&Key::ZoneState(1).to_string()));
    }

    // -- Retry --------------------------------------------------------------

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = with_retry(fast_retry(), "get", "k", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("database is locked")
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_is_error() {
        let calls = AtomicU32::new(0);
        let err = with_retry(fast_retry(), "set", "zone/0/vwc", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("disk I/O error") }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let msg = err.to_string();
        assert!(
            msg.contains("kv set 'zone/0/vwc' failed after 3 attempts: disk I/O error"),
            "got: {msg}"
        );
    }

    #[tokio::test]
    async fn retry_policy_never_zero_attempts() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }

    // -- SQLite store -------------------------------------------------------

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let kv = memory_kv().await;
        assert_eq!(kv.get(&Key::LastRunDate).await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get() {
        let kv = memory_kv().await;
        kv.set(&Key::ZoneVwc(2), "14.5").await.unwrap();
        assert_eq!(
            kv.get(&Key::ZoneVwc(2)).await.unwrap().as_deref(),
            Some("14.5")
        );
    }

    #[tokio::test]
    async fn set_overwrites() {
        let kv = memory_kv().await;
        kv.set(&Key::ZoneState(0), "Running").await.unwrap();
        kv.set(&Key::ZoneState(0), "Complete").await.unwrap();
        assert_eq!(
            kv.get(&Key::ZoneState(0)).await.unwrap().as_deref(),
            Some("Complete")
        );
    }

    #[tokio::test]
    async fn set_all_writes_every_entry() {
        let kv = memory_kv().await;
        kv.set_all(&[
            (Key::ZoneState(1), "Complete".to_string()),
            (Key::ZoneVwc(1), "20".to_string()),
        ])
        .await
        .unwrap();
        assert_eq!(
            kv.get(&Key::ZoneState(1)).await.unwrap().as_deref(),
            Some("Complete")
        );
        assert_eq!(kv.get(&Key::ZoneVwc(1)).await.unwrap().as_deref(), Some("20"));
    }

    #[tokio::test]
    async fn compaction_on_memory_db_is_harmless() {
        let kv = memory_kv().await;
        kv.set(&Key::LastRunDate, "2026-07-15").await.unwrap();
        kv.compact().await;
        assert_eq!(
            kv.get(&Key::LastRunDate).await.unwrap().as_deref(),
            Some("2026-07-15")
        );
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("irctl-kv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.join("state.db").display());

        {
            let kv = SqliteKv::connect(&url, fast_retry()).await.unwrap();
            kv.set(&Key::ZoneState(4), "Running").await.unwrap();
            kv.pool.close().await;
        }
        let kv = SqliteKv::connect(&url, fast_retry()).await.unwrap();
        assert_eq!(
            kv.get(&Key::ZoneState(4)).await.unwrap().as_deref(),
            Some("Running")
        );
        kv.pool.close().await;
        let _ = std::fs::remove_dir_all(&dir);
    }
}
