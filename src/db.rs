use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{KvError, Result};
use crate::keys::{Keys, ScanResult};
use crate::types::{Key, ZMember};
use crate::zset::{self, InterCmd, RangeCmd, UnionCmd};

/// Default reap interval in milliseconds (60 seconds)
const DEFAULT_REAP_INTERVAL_MS: i64 = 60_000;

/// Shared database backend (SQLite connection plus reaper state)
struct DbCore {
    conn: Mutex<Connection>,
    /// Whether the inline expired-key reaper is enabled (default: true)
    reaper_enabled: AtomicBool,
    /// Last reap timestamp in milliseconds (shared across all handles)
    last_reap: AtomicI64,
    /// Reap interval in milliseconds (configurable, default: 60s)
    reap_interval_ms: AtomicI64,
}

/// Database handle over the key registry and sorted-set store.
///
/// Cloning is cheap; all clones share one connection. Reads and writes
/// can go through the convenience methods here, or through
/// [`Keys`](crate::keys::Keys) and the [`zset`](crate::zset) commands
/// inside an explicit [`Db::view`] / [`Db::update`] scope.
///
/// # Example
/// ```
/// use scorelite::{Db, ZMember};
///
/// let db = Db::open_memory().unwrap();
/// db.zadd("race", &[ZMember::new(9.5, "ann"), ZMember::new(7.1, "bob")])
///     .unwrap();
/// let first = db.zrange("race").by_rank(0, 0).run().unwrap();
/// assert_eq!(first[0].elem, b"bob".to_vec());
/// ```
#[derive(Clone)]
pub struct Db {
    core: Arc<DbCore>,
}

impl Db {
    /// Open or create a database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode and optimize pragmas for performance
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA cache_size = -64000;",
        )?;

        let db = Self {
            core: Arc::new(DbCore {
                conn: Mutex::new(conn),
                reaper_enabled: AtomicBool::new(true),
                last_reap: AtomicI64::new(0),
                reap_interval_ms: AtomicI64::new(DEFAULT_REAP_INTERVAL_MS),
            }),
        };

        db.migrate()?;
        Ok(db)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Current time in milliseconds since epoch
    pub fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    /// Runs `f` against a fresh write transaction. Commits when `f`
    /// returns `Ok`, rolls back when it returns `Err`.
    pub fn update<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Runs `f` against the shared connection for reads.
    pub fn view<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }

    /// Enable or disable the inline reaper of expired keys
    pub fn set_reaper(&self, enabled: bool) {
        self.core.reaper_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Check if the inline reaper is enabled
    pub fn reaper_enabled(&self) -> bool {
        self.core.reaper_enabled.load(Ordering::Relaxed)
    }

    /// Set the reap interval in milliseconds (default: 60000 = 60s)
    pub fn set_reap_interval(&self, interval_ms: i64) {
        self.core
            .reap_interval_ms
            .store(interval_ms.max(1), Ordering::Relaxed);
    }

    /// Get the current reap interval in milliseconds
    pub fn reap_interval(&self) -> i64 {
        self.core.reap_interval_ms.load(Ordering::Relaxed)
    }

    // Rate-limited sweep of expired keys, called from write paths.
    // One handle claims the interval slot; the rest skip.
    fn maybe_reap(&self) {
        if !self.core.reaper_enabled.load(Ordering::Relaxed) {
            return;
        }
        let now = Self::now_ms();
        let last = self.core.last_reap.load(Ordering::Relaxed);
        let interval = self.core.reap_interval_ms.load(Ordering::Relaxed);
        if now - last < interval {
            return;
        }
        if self
            .core
            .last_reap
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        match self.update(|tx| Keys::new(tx).delete_expired(0)) {
            Ok(reaped) if reaped > 0 => tracing::debug!(reaped, "reaped expired keys"),
            Ok(_) => {}
            Err(err) => tracing::debug!(%err, "expired-key reap failed"),
        }
    }

    // --- key registry ---

    /// EXISTS key
    pub fn exists(&self, key: &str) -> Result<bool> {
        self.view(|conn| Keys::new(conn).exists(key))
    }

    /// Number of live keys among those specified
    pub fn count(&self, keys: &[&str]) -> Result<usize> {
        self.view(|conn| Keys::new(conn).count(keys))
    }

    /// Full key record, or `None` when absent or expired
    pub fn get_key(&self, key: &str) -> Result<Option<Key>> {
        self.view(|conn| Keys::new(conn).get(key))
    }

    /// KEYS pattern
    pub fn keys(&self, pattern: &str) -> Result<Vec<Key>> {
        self.view(|conn| Keys::new(conn).keys(pattern))
    }

    /// SCAN cursor MATCH pattern COUNT page_size
    pub fn scan(&self, cursor: i64, pattern: &str, page_size: usize) -> Result<ScanResult> {
        self.view(|conn| Keys::new(conn).scan(cursor, pattern, page_size))
    }

    /// RANDOMKEY
    pub fn random_key(&self) -> Result<Option<Key>> {
        self.view(|conn| Keys::new(conn).random())
    }

    /// PEXPIRE key ttl - returns whether a live key was updated
    pub fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.maybe_reap();
        self.update(|tx| Keys::new(tx).expire(key, ttl))
    }

    /// PEXPIREAT key at_ms - returns whether a live key was updated
    pub fn expire_at(&self, key: &str, at_ms: i64) -> Result<bool> {
        self.maybe_reap();
        self.update(|tx| Keys::new(tx).expire_at(key, at_ms))
    }

    /// PERSIST key - returns whether a live key was updated
    pub fn persist(&self, key: &str) -> Result<bool> {
        self.update(|tx| Keys::new(tx).persist(key))
    }

    /// RENAME key newkey
    pub fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        self.maybe_reap();
        self.update(|tx| Keys::new(tx).rename(key, new_key))
    }

    /// RENAMENX key newkey - returns whether the rename happened
    pub fn rename_if_absent(&self, key: &str, new_key: &str) -> Result<bool> {
        self.maybe_reap();
        self.update(|tx| Keys::new(tx).rename_if_absent(key, new_key))
    }

    /// DEL key [key ...] - returns the number of keys deleted
    pub fn delete(&self, keys: &[&str]) -> Result<usize> {
        self.maybe_reap();
        self.update(|tx| Keys::new(tx).delete(keys))
    }

    /// Reap up to `n` expired keys (0 reaps all); returns count removed
    pub fn delete_expired(&self, n: usize) -> Result<usize> {
        self.update(|tx| Keys::new(tx).delete_expired(n))
    }

    /// FLUSHDB: removes every key, reclaims storage and verifies
    /// integrity. Runs directly on the connection and must not be
    /// called inside [`Db::update`] - SQLite forbids VACUUM inside a
    /// transaction.
    pub fn delete_all(&self) -> Result<()> {
        let conn = self.core.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("delete from keys", [])?;
        conn.execute_batch("vacuum")?;
        let status: String = conn.query_row("pragma integrity_check", [], |row| row.get(0))?;
        if status != "ok" {
            return Err(KvError::Other(format!("integrity check failed: {status}")));
        }
        tracing::debug!("deleted all keys");
        Ok(())
    }

    // --- sorted sets ---

    /// ZADD key score member [score member ...] - returns the number of
    /// new members
    pub fn zadd(&self, key: &str, items: &[ZMember]) -> Result<usize> {
        self.maybe_reap();
        self.update(|tx| zset::add(tx, key, items))
    }

    /// ZSCORE key member
    pub fn zscore(&self, key: &str, elem: &[u8]) -> Result<Option<f64>> {
        self.view(|conn| zset::score(conn, key, elem))
    }

    /// ZCARD key
    pub fn zcard(&self, key: &str) -> Result<i64> {
        self.view(|conn| zset::card(conn, key))
    }

    /// ZRANGE/ZRANGEBYSCORE builder over one key
    pub fn zrange(&self, key: &str) -> RangeCmd<'_> {
        RangeCmd::new(self, key)
    }

    /// ZINTER/ZINTERSTORE builder over the source keys
    pub fn zinter(&self, keys: &[&str]) -> InterCmd<'_> {
        InterCmd::new(self, keys)
    }

    /// ZUNION/ZUNIONSTORE builder over the source keys
    pub fn zunion(&self, keys: &[&str]) -> UnionCmd<'_> {
        UnionCmd::new(self, keys)
    }
}
