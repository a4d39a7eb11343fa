use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS members (
    key           TEXT NOT NULL,
    member        BLOB NOT NULL,
    created_at    TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (key, member)
);

CREATE TABLE IF NOT EXISTS expiry (
    key           TEXT PRIMARY KEY,
    expires_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS locks (
    key           TEXT PRIMARY KEY,
    token         TEXT NOT NULL,
    expires_at    INTEGER NOT NULL
);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Set containers and a lock table kept in one SQLite file.
///
/// Keys follow cache-server semantics: a set key exists while it has members,
/// `expire` only applies to existing keys, and an expired key disappears with
/// all of its members. Every mutating call runs in an immediate transaction so
/// several processes can share the file.
pub struct CacheStore {
    path: PathBuf,
    conn: Connection,
}

impl CacheStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create cache directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache database {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("failed to set cache busy timeout")?;
        conn.pragma_update(None, "journal_mode", &"wal")
            .context("failed to enable WAL for cache")?;
        conn.pragma_update(None, "synchronous", &"normal").ok();
        conn.execute_batch(SCHEMA)
            .context("failed to initialize cache schema")?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    /// Adds `member` to the set at `key`. Returns false if it was already present.
    pub fn sadd(&mut self, key: &str, member: &[u8]) -> Result<bool> {
        let tx = self.begin()?;
        purge_expired(&tx, now_ms())?;
        let added = tx.execute(
            "INSERT OR IGNORE INTO members(key, member) VALUES (?1, ?2)",
            params![key, member],
        )?;
        tx.commit()?;
        Ok(added == 1)
    }

    /// Removes and returns an arbitrary member of the set at `key`.
    pub fn spop(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let tx = self.begin()?;
        purge_expired(&tx, now_ms())?;
        let member: Option<Vec<u8>> = tx
            .query_row(
                "SELECT member FROM members WHERE key = ?1 ORDER BY RANDOM() LIMIT 1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(member) = &member {
            tx.execute(
                "DELETE FROM members WHERE key = ?1 AND member = ?2",
                params![key, member],
            )?;
            if count_members(&tx, key)? == 0 {
                tx.execute("DELETE FROM expiry WHERE key = ?1", [key])?;
            }
        }
        tx.commit()?;
        Ok(member)
    }

    pub fn scard(&mut self, key: &str) -> Result<usize> {
        let tx = self.begin()?;
        purge_expired(&tx, now_ms())?;
        let count = count_members(&tx, key)?;
        tx.commit()?;
        Ok(count)
    }

    pub fn exists(&mut self, key: &str) -> Result<bool> {
        Ok(self.scard(key)? > 0)
    }

    /// Sets the time to live of `key`. Returns false when the key does not exist.
    pub fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();
        let tx = self.begin()?;
        purge_expired(&tx, now)?;
        if count_members(&tx, key)? == 0 {
            tx.commit()?;
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO expiry(key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
            params![key, deadline(now, ttl)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Takes the lock at `key` for `token` unless another live holder owns it.
    pub fn try_lock(&mut self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();
        let tx = self.begin()?;
        tx.execute("DELETE FROM locks WHERE expires_at <= ?1", [now])?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO locks(key, token, expires_at) VALUES (?1, ?2, ?3)",
            params![key, token, deadline(now, ttl)],
        )?;
        tx.commit()?;
        if inserted == 1 {
            debug!(key, "lock taken");
        }
        Ok(inserted == 1)
    }

    /// Extends a live lock held by `token`. Returns false if it expired or changed hands.
    pub fn refresh_lock(&mut self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();
        let tx = self.begin()?;
        let updated = tx.execute(
            "UPDATE locks SET expires_at = ?1 WHERE key = ?2 AND token = ?3 AND expires_at > ?4",
            params![deadline(now, ttl), key, token, now],
        )?;
        tx.commit()?;
        Ok(updated == 1)
    }

    pub fn unlock(&mut self, key: &str, token: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND token = ?2",
            params![key, token],
        )?;
        Ok(deleted == 1)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn begin(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin cache transaction")
    }
}

fn purge_expired(tx: &Transaction<'_>, now: i64) -> Result<()> {
    let purged = tx.execute(
        "DELETE FROM members WHERE key IN (SELECT key FROM expiry WHERE expires_at <= ?1)",
        [now],
    )?;
    tx.execute("DELETE FROM expiry WHERE expires_at <= ?1", [now])?;
    if purged > 0 {
        debug!(purged, "purged expired members");
    }
    Ok(())
}

fn count_members(tx: &Transaction<'_>, key: &str) -> Result<usize> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM members WHERE key = ?1",
        [key],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

fn deadline(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(ttl.as_millis() as i64)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn spop_on_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let mut store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        assert!(store.spop("nothing").unwrap().is_none());
        assert!(!store.exists("nothing").unwrap());
    }

    #[test]
    fn expire_requires_existing_key() {
        let dir = tempdir().unwrap();
        let mut store = CacheStore::open(dir.path().join("cache.db")).unwrap();
        assert!(!store.expire("ghost", Duration::from_secs(5)).unwrap());
        store.sadd("real", b"x").unwrap();
        assert!(store.expire("real", Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn deadline_saturates() {
        assert_eq!(deadline(i64::MAX - 1, Duration::from_secs(10)), i64::MAX);
    }
}
