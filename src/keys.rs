//! Key registry: the typed, versioned, TTL-aware namespace owning the
//! lifecycle of every user-visible key.
//!
//! Every read filters on liveness (`etime is null or etime > now`), so
//! expired-but-unreaped rows are invisible everywhere until the reaper
//! collects them.

use rusqlite::{named_params, Connection, OptionalExtension};
use std::time::Duration;

use crate::db::Db;
use crate::error::{KvError, Result};
use crate::sql;
use crate::types::{Key, KeyType};

const SQL_GET: &str = "
select id, key, type, version, etime, mtime
from keys
where key = :key and (etime is null or etime > :now)";

const SQL_COUNT: &str = "
select count(id) from keys
where key in (:keys) and (etime is null or etime > :now)";

const SQL_KEYS: &str = "
select id, key, type, version, etime, mtime from keys
where key glob :pattern and (etime is null or etime > :now)";

const SQL_SCAN: &str = "
select id, key, type, version, etime, mtime from keys
where id > :cursor and key glob :pattern and (etime is null or etime > :now)
order by id
limit :count";

const SQL_RANDOM: &str = "
select id, key, type, version, etime, mtime from keys
where etime is null or etime > :now
order by random() limit 1";

const SQL_EXPIRE: &str = "
update keys set etime = :at
where key = :key and (etime is null or etime > :now)";

const SQL_PERSIST: &str = "
update keys set etime = null
where key = :key and (etime is null or etime > :now)";

// Replace-by-old-identity: the row at :key is overwritten in place with
// the new name, keeping id, type and etime, bumping version.
const SQL_RENAME: &str = "
update or replace keys set
  id = old.id,
  key = :new_key,
  type = old.type,
  version = old.version + 1,
  etime = old.etime,
  mtime = :now
from (
  select id, key, type, version, etime, mtime
  from keys
  where key = :key and (etime is null or etime > :now)
) as old
where keys.key = :key and (keys.etime is null or keys.etime > :now)";

const SQL_DELETE: &str = "
delete from keys where key in (:keys)
  and (etime is null or etime > :now)";

const SQL_DELETE_TYPE: &str = "
delete from keys where key in (:keys)
  and (etime is null or etime > :now)
  and type = :type";

const SQL_DELETE_ALL_EXPIRED: &str = "
delete from keys where etime <= :now";

const SQL_DELETE_N_EXPIRED: &str = "
delete from keys where rowid in (
  select rowid from keys
  where etime <= :now
  limit :n
)";

const SCAN_PAGE_SIZE: usize = 10;

fn read_key(row: &rusqlite::Row) -> rusqlite::Result<Key> {
    Ok(Key {
        id: row.get(0)?,
        key: row.get(1)?,
        type_tag: row.get(2)?,
        version: row.get(3)?,
        etime: row.get(4)?,
        mtime: row.get(5)?,
    })
}

// SQLite GLOB spells a negated class [^abc]; accept the conventional
// [!abc] form as well. There is no escape character.
fn glob(pattern: &str) -> String {
    pattern.replace("[!", "[^")
}

/// One page of scan results plus the cursor to resume from.
///
/// The cursor is the maximum key id seen so far; an empty page marks
/// the end of iteration.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub cursor: i64,
    pub keys: Vec<Key>,
}

/// Transaction-scoped view over the key registry.
///
/// Borrows any connection or transaction handle and runs every call in
/// the caller's transaction scope. [`Db`](crate::Db) exposes the same
/// operations with per-call transactions for convenience.
#[derive(Clone, Copy)]
pub struct Keys<'c> {
    conn: &'c Connection,
}

impl<'c> Keys<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Reports whether the key exists and is live.
    pub fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.count(&[key])? > 0)
    }

    /// Returns the number of live keys among those specified.
    pub fn count(&self, keys: &[&str]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let query = sql::expand_in(SQL_COUNT, ":keys", keys.len());
        let mut args = sql::in_args(":keys", keys);
        args.push((":now".to_owned(), Box::new(Db::now_ms())));
        let count: i64 =
            self.conn
                .query_row(&query, sql::params_ref(&args).as_slice(), |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Returns the key record, or `None` if the key is absent or expired.
    pub fn get(&self, key: &str) -> Result<Option<Key>> {
        let record = self
            .conn
            .query_row(
                SQL_GET,
                named_params! { ":key": key, ":now": Db::now_ms() },
                read_key,
            )
            .optional()?;
        Ok(record)
    }

    /// Returns all live keys matching a glob pattern, like `key*`, `k?y`,
    /// `k[bce]y` or `k[!a-c][y-z]`. Ordering is unspecified.
    ///
    /// Loads every match at once; prefer [`Keys::scan`] or
    /// [`Keys::scanner`] when the match set may be large.
    pub fn keys(&self, pattern: &str) -> Result<Vec<Key>> {
        let mut stmt = self.conn.prepare(SQL_KEYS)?;
        let rows = stmt.query_map(
            named_params! { ":pattern": glob(pattern), ":now": Db::now_ms() },
            read_key,
        )?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Returns the next page of live keys matching a pattern, in
    /// ascending id order, starting after `cursor`. An empty page means
    /// the iteration is done. `page_size = 0` selects the default of 10.
    pub fn scan(&self, cursor: i64, pattern: &str, page_size: usize) -> Result<ScanResult> {
        let page_size = if page_size == 0 {
            SCAN_PAGE_SIZE
        } else {
            page_size
        };
        let mut stmt = self.conn.prepare(SQL_SCAN)?;
        let rows = stmt.query_map(
            named_params! {
                ":cursor": cursor,
                ":pattern": glob(pattern),
                ":now": Db::now_ms(),
                ":count": page_size as i64,
            },
            read_key,
        )?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        // Ids come back ascending, so the cursor is the last one.
        let cursor = keys.last().map_or(cursor, |k| k.id);
        Ok(ScanResult { cursor, keys })
    }

    /// Returns a lazy iterator over live keys matching a pattern,
    /// fetching `page_size` keys per round trip.
    /// See [`Keys::keys`] for the pattern syntax.
    pub fn scanner(&self, pattern: &str, page_size: usize) -> Scanner<'c> {
        Scanner::new(*self, pattern, page_size)
    }

    /// Returns a uniformly random live key, or `None` when the
    /// namespace is empty.
    pub fn random(&self) -> Result<Option<Key>> {
        let record = self
            .conn
            .query_row(SQL_RANDOM, named_params! { ":now": Db::now_ms() }, read_key)
            .optional()?;
        Ok(record)
    }

    /// Sets a time-to-live for the key relative to now.
    /// Returns false if the key does not exist.
    pub fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.expire_at(key, Db::now_ms() + ttl.as_millis() as i64)
    }

    /// Sets an absolute expiration time (milliseconds since epoch).
    /// Returns false if the key does not exist.
    pub fn expire_at(&self, key: &str, at_ms: i64) -> Result<bool> {
        let updated = self.conn.execute(
            SQL_EXPIRE,
            named_params! { ":key": key, ":now": Db::now_ms(), ":at": at_ms },
        )?;
        Ok(updated > 0)
    }

    /// Clears the expiration time for the key.
    /// Returns false if the key does not exist.
    pub fn persist(&self, key: &str) -> Result<bool> {
        let updated = self.conn.execute(
            SQL_PERSIST,
            named_params! { ":key": key, ":now": Db::now_ms() },
        )?;
        Ok(updated > 0)
    }

    /// Renames a key, displacing any live key already holding the new
    /// name. The record keeps its id, type and expiry; version is bumped
    /// and mtime refreshed. Fails with [`KvError::NotFound`] if the old
    /// key does not exist; renaming a key to itself is a no-op.
    pub fn rename(&self, key: &str, new_key: &str) -> Result<()> {
        if self.get(key)?.is_none() {
            return Err(KvError::NotFound);
        }
        if key == new_key {
            return Ok(());
        }

        // Drop whatever holds the target name, regardless of type.
        self.delete(&[new_key])?;

        self.conn.execute(
            SQL_RENAME,
            named_params! { ":key": key, ":new_key": new_key, ":now": Db::now_ms() },
        )?;
        Ok(())
    }

    /// Renames a key only when the new name is free. Returns whether the
    /// rename happened. Fails with [`KvError::NotFound`] if the old key
    /// does not exist.
    pub fn rename_if_absent(&self, key: &str, new_key: &str) -> Result<bool> {
        if self.get(key)?.is_none() {
            return Err(KvError::NotFound);
        }
        if key == new_key {
            return Ok(false);
        }
        if self.exists(new_key)? {
            return Ok(false);
        }

        self.conn.execute(
            SQL_RENAME,
            named_params! { ":key": key, ":new_key": new_key, ":now": Db::now_ms() },
        )?;
        Ok(true)
    }

    /// Deletes keys and their values regardless of type. Returns the
    /// number of keys deleted; absent and expired names are ignored.
    pub fn delete(&self, keys: &[&str]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let query = sql::expand_in(SQL_DELETE, ":keys", keys.len());
        let mut args = sql::in_args(":keys", keys);
        args.push((":now".to_owned(), Box::new(Db::now_ms())));
        let deleted = self
            .conn
            .execute(&query, sql::params_ref(&args).as_slice())?;
        Ok(deleted)
    }

    /// Deletes keys of a specific type. Returns the number of keys
    /// deleted; absent names and keys of other types are ignored.
    pub fn delete_by_type(&self, typ: KeyType, keys: &[&str]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let query = sql::expand_in(SQL_DELETE_TYPE, ":keys", keys.len());
        let mut args = sql::in_args(":keys", keys);
        args.push((":now".to_owned(), Box::new(Db::now_ms())));
        args.push((":type".to_owned(), Box::new(typ as i32)));
        let deleted = self
            .conn
            .execute(&query, sql::params_ref(&args).as_slice())?;
        Ok(deleted)
    }

    /// Reaps expired keys, at most `n` of them (0 reaps all).
    /// Returns the number of keys removed.
    pub fn delete_expired(&self, n: usize) -> Result<usize> {
        let now = Db::now_ms();
        let deleted = if n > 0 {
            self.conn.execute(
                SQL_DELETE_N_EXPIRED,
                named_params! { ":now": now, ":n": n as i64 },
            )?
        } else {
            self.conn
                .execute(SQL_DELETE_ALL_EXPIRED, named_params! { ":now": now })?
        };
        Ok(deleted)
    }
}

/// Lazy iterator over live keys matching a pattern.
///
/// Yields keys one at a time, fetching a new page from the registry
/// whenever the buffered page runs out. The first fetch error is yielded
/// once and ends the iteration; an empty page ends it silently. A
/// scanner is single-owner state and must not be shared.
pub struct Scanner<'c> {
    keys: Keys<'c>,
    cursor: i64,
    pattern: String,
    page_size: usize,
    buf: std::vec::IntoIter<Key>,
    done: bool,
}

impl<'c> Scanner<'c> {
    fn new(keys: Keys<'c>, pattern: &str, page_size: usize) -> Self {
        Self {
            keys,
            cursor: 0,
            pattern: pattern.to_owned(),
            page_size: if page_size == 0 {
                SCAN_PAGE_SIZE
            } else {
                page_size
            },
            buf: Vec::new().into_iter(),
            done: false,
        }
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Some(key) = self.buf.next() {
            return Some(Ok(key));
        }
        match self.keys.scan(self.cursor, &self.pattern, self.page_size) {
            Ok(page) => {
                if page.keys.is_empty() {
                    self.done = true;
                    return None;
                }
                self.cursor = page.cursor;
                self.buf = page.keys.into_iter();
                self.buf.next().map(Ok)
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::types::ZMember;

    fn zkey(db: &Db, key: &str) {
        db.zadd(key, &[ZMember::new(1.0, "elem")]).unwrap();
    }

    // A row of a non-sorted-set type; the registry stores tags opaquely.
    fn string_key(db: &Db, key: &str) {
        db.update(|tx| {
            tx.execute(
                "insert into keys (key, type, version, mtime) values (?1, ?2, 0, ?3)",
                rusqlite::params![key, KeyType::String as i32, Db::now_ms()],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_get_exists() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "alpha");

        db.view(|conn| {
            let keys = Keys::new(conn);
            assert!(keys.exists("alpha").unwrap());
            assert!(!keys.exists("beta").unwrap());

            let rec = keys.get("alpha").unwrap().unwrap();
            assert_eq!(rec.key, "alpha");
            assert_eq!(rec.key_type(), Some(KeyType::ZSet));
            assert_eq!(rec.etime, None);
            assert!(keys.get("beta").unwrap().is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_count() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "a");
        zkey(&db, "b");

        db.view(|conn| {
            let keys = Keys::new(conn);
            assert_eq!(keys.count(&["a", "b", "missing"]).unwrap(), 2);
            assert_eq!(keys.count(&[]).unwrap(), 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_keys_glob() {
        let db = Db::open_memory().unwrap();
        for name in ["key", "kay", "kby", "other"] {
            zkey(&db, name);
        }

        db.view(|conn| {
            let keys = Keys::new(conn);

            let mut names: Vec<String> = keys
                .keys("k?y")
                .unwrap()
                .into_iter()
                .map(|k| k.key)
                .collect();
            names.sort();
            assert_eq!(names, ["kay", "kby", "key"]);

            let names: Vec<String> = keys
                .keys("k[be]y")
                .unwrap()
                .into_iter()
                .map(|k| k.key)
                .collect();
            assert_eq!(names.len(), 2);

            // [!..] negation and ranges
            let names: Vec<String> = keys
                .keys("k[!a-b]y")
                .unwrap()
                .into_iter()
                .map(|k| k.key)
                .collect();
            assert_eq!(names, ["key"]);

            assert_eq!(keys.keys("*").unwrap().len(), 4);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_scan_pages() {
        let db = Db::open_memory().unwrap();
        for i in 0..25 {
            zkey(&db, &format!("key:{i:02}"));
        }
        zkey(&db, "other");

        db.view(|conn| {
            let keys = Keys::new(conn);

            let mut cursor = 0;
            let mut seen = Vec::new();
            loop {
                let page = keys.scan(cursor, "key:*", 10).unwrap();
                if page.keys.is_empty() {
                    break;
                }
                for k in &page.keys {
                    assert!(k.id > cursor);
                }
                cursor = page.cursor;
                seen.extend(page.keys.into_iter().map(|k| k.key));
            }
            assert_eq!(seen.len(), 25);
            // Ascending id order implies insertion order here.
            assert_eq!(seen[0], "key:00");
            assert_eq!(seen[24], "key:24");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_scan_default_page_size() {
        let db = Db::open_memory().unwrap();
        for i in 0..15 {
            zkey(&db, &format!("k{i}"));
        }

        db.view(|conn| {
            let page = Keys::new(conn).scan(0, "*", 0).unwrap();
            assert_eq!(page.keys.len(), 10);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_scanner() {
        let db = Db::open_memory().unwrap();
        for i in 0..12 {
            zkey(&db, &format!("k{i:02}"));
        }

        db.view(|conn| {
            let keys = Keys::new(conn);
            let mut scanner = keys.scanner("k*", 5);
            let mut count = 0;
            for key in &mut scanner {
                key.unwrap();
                count += 1;
            }
            assert_eq!(count, 12);
            // Exhausted scanner stays exhausted.
            assert!(scanner.next().is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_scanner_empty() {
        let db = Db::open_memory().unwrap();
        db.view(|conn| {
            let keys = Keys::new(conn);
            assert!(keys.scanner("*", 10).next().is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_random() {
        let db = Db::open_memory().unwrap();
        db.view(|conn| {
            assert!(Keys::new(conn).random().unwrap().is_none());
            Ok(())
        })
        .unwrap();

        zkey(&db, "only");
        db.view(|conn| {
            let rec = Keys::new(conn).random().unwrap().unwrap();
            assert_eq!(rec.key, "only");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_expire_persist_round_trip() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "k");

        db.update(|tx| {
            let keys = Keys::new(tx);
            assert!(keys.expire("k", Duration::from_secs(60)).unwrap());
            assert!(keys.get("k").unwrap().unwrap().etime.is_some());

            assert!(keys.persist("k").unwrap());
            assert_eq!(keys.get("k").unwrap().unwrap().etime, None);

            assert!(!keys.expire("missing", Duration::from_secs(60)).unwrap());
            assert!(!keys.persist("missing").unwrap());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_expired_key_is_invisible() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "k");

        db.update(|tx| {
            let keys = Keys::new(tx);
            // A past expiry takes effect immediately.
            assert!(keys.expire_at("k", Db::now_ms() - 100).unwrap());
            assert!(!keys.exists("k").unwrap());
            assert!(keys.get("k").unwrap().is_none());
            assert!(keys.keys("*").unwrap().is_empty());
            assert!(keys.random().unwrap().is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rename_preserves_identity() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "k");

        let pre = db.get_key("k").unwrap().unwrap();
        db.update(|tx| {
            let keys = Keys::new(tx);
            keys.expire("k", Duration::from_secs(600)).unwrap();
            let pre_etime = keys.get("k").unwrap().unwrap().etime;
            keys.rename("k", "k2").unwrap();

            assert!(keys.get("k").unwrap().is_none());
            let post = keys.get("k2").unwrap().unwrap();
            assert_eq!(post.id, pre.id);
            assert_eq!(post.version, pre.version + 1);
            assert_eq!(post.etime, pre_etime);
            assert_eq!(post.type_tag, pre.type_tag);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rename_displaces_target() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "a");
        string_key(&db, "b");

        db.update(|tx| {
            let keys = Keys::new(tx);
            let pre = keys.get("a").unwrap().unwrap();
            keys.rename("a", "b").unwrap();

            let post = keys.get("b").unwrap().unwrap();
            assert_eq!(post.id, pre.id);
            assert_eq!(post.key_type(), Some(KeyType::ZSet));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rename_missing_and_self() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "k");

        db.update(|tx| {
            let keys = Keys::new(tx);
            assert!(matches!(
                keys.rename("missing", "x"),
                Err(KvError::NotFound)
            ));

            let pre = keys.get("k").unwrap().unwrap();
            keys.rename("k", "k").unwrap();
            assert_eq!(keys.get("k").unwrap().unwrap(), pre);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rename_if_absent() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "a");
        zkey(&db, "b");

        db.update(|tx| {
            let keys = Keys::new(tx);
            // Target live: no mutation.
            assert!(!keys.rename_if_absent("a", "b").unwrap());
            assert!(keys.exists("a").unwrap());

            assert!(keys.rename_if_absent("a", "c").unwrap());
            assert!(!keys.exists("a").unwrap());
            assert!(keys.exists("c").unwrap());

            assert!(matches!(
                keys.rename_if_absent("missing", "x"),
                Err(KvError::NotFound)
            ));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "a");
        zkey(&db, "b");
        zkey(&db, "c");

        db.update(|tx| {
            let keys = Keys::new(tx);
            assert_eq!(keys.delete(&["a", "b", "missing"]).unwrap(), 2);
            assert!(!keys.exists("a").unwrap());
            assert!(keys.exists("c").unwrap());
            assert_eq!(keys.delete(&[]).unwrap(), 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_by_type() {
        let db = Db::open_memory().unwrap();
        zkey(&db, "z");
        string_key(&db, "s");

        db.update(|tx| {
            let keys = Keys::new(tx);
            assert_eq!(keys.delete_by_type(KeyType::ZSet, &["z", "s"]).unwrap(), 1);
            assert!(!keys.exists("z").unwrap());
            assert!(keys.exists("s").unwrap());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_expired() {
        let db = Db::open_memory().unwrap();
        for i in 0..5 {
            zkey(&db, &format!("dying{i}"));
        }
        zkey(&db, "living");

        db.update(|tx| {
            let keys = Keys::new(tx);
            for i in 0..5 {
                keys.expire(&format!("dying{i}"), Duration::from_millis(10))
                    .unwrap();
            }
            Ok(())
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(40));

        db.update(|tx| {
            let keys = Keys::new(tx);
            assert_eq!(keys.delete_expired(2).unwrap(), 2);
            assert_eq!(keys.delete_expired(0).unwrap(), 3);
            assert_eq!(keys.delete_expired(0).unwrap(), 0);
            assert!(keys.exists("living").unwrap());
            Ok(())
        })
        .unwrap();
    }
}
