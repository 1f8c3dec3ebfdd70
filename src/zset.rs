//! Sorted-set algebra: ranged lookups by rank and by score, plus
//! multi-key intersection and union with pluggable score aggregation.
//!
//! Commands are immutable builder-style descriptors. Each carries either
//! a [`Db`] handle (terminal methods open their own transaction) or a
//! caller-supplied connection/transaction and run within it. The store
//! forms replace the destination key through the key registry so that
//! type discipline holds.

use rusqlite::{named_params, Connection, OptionalExtension};

use crate::db::Db;
use crate::error::{self, KvError, Result};
use crate::keys::Keys;
use crate::sql::{self, Aggregate, SortDir};
use crate::types::{KeyType, ZMember};

// Ranks are dense and zero-based over (score, elem). The outer ordering
// carries no direction token: rows always come back in rank order,
// whichever way the window ranks.
const SQL_RANGE_RANK: &str = "
with ranked as (
  select elem, score, (row_number() over w - 1) as rank
  from zset
    join keys on key_id = keys.id and (etime is null or etime > :now)
  where key = :key
  window w as (partition by key_id order by score asc, elem asc)
)
select elem, score
from ranked
where rank between :start and :stop
order by rank";

const SQL_RANGE_SCORE: &str = "
select elem, score
from zset
  join keys on key_id = keys.id and (etime is null or etime > :now)
where key = :key
  and score between :start and :stop
order by score asc, elem asc";

const SQL_INTER: &str = "
select elem, sum(score) as score
from zset
  join keys on key_id = keys.id and (etime is null or etime > :now)
where key in (:keys)
group by elem
having count(distinct key_id) = :nkeys
order by sum(score), elem";

const SQL_INTER_STORE: &str = "
insert into zset (key_id, elem, score)
select :dest_id, elem, sum(score) as score
from zset
  join keys on key_id = keys.id and (etime is null or etime > :now)
where key in (:keys)
group by elem
having count(distinct key_id) = :nkeys
order by sum(score), elem";

const SQL_UNION: &str = "
select elem, sum(score) as score
from zset
  join keys on key_id = keys.id and (etime is null or etime > :now)
where key in (:keys)
group by elem
order by sum(score), elem";

const SQL_UNION_STORE: &str = "
insert into zset (key_id, elem, score)
select :dest_id, elem, sum(score) as score
from zset
  join keys on key_id = keys.id and (etime is null or etime > :now)
where key in (:keys)
group by elem
order by sum(score), elem";

const SQL_STORE_KEY: &str = "
insert into keys (key, type, version, mtime)
values (:key, :type, :version, :mtime)
returning id";

const SQL_DELETE_EXPIRED_DEST: &str = "
delete from keys where key = :key and etime is not null and etime <= :now";

const SQL_SCORE: &str = "
select score
from zset
  join keys on key_id = keys.id and (etime is null or etime > :now)
where key = :key and elem = :elem";

const SQL_CARD: &str = "
select count(*)
from zset
  join keys on key_id = keys.id and (etime is null or etime > :now)
where key = :key";

fn read_member(row: &rusqlite::Row) -> rusqlite::Result<ZMember> {
    Ok(ZMember {
        elem: row.get(0)?,
        score: row.get(1)?,
    })
}

/// Execution target: a database handle (terminals open their own write
/// transaction) or a caller-supplied connection/transaction.
#[derive(Clone, Copy)]
enum Handle<'a> {
    Db(&'a Db),
    Conn(&'a Connection),
}

impl<'a> Handle<'a> {
    fn view<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match self {
            Handle::Db(db) => db.view(f),
            Handle::Conn(conn) => f(conn),
        }
    }

    fn update<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match self {
            Handle::Db(db) => db.update(|tx| f(tx)),
            Handle::Conn(conn) => f(conn),
        }
    }
}

/// Upserts members of a sorted set, creating the key on first write.
/// Returns the number of members that did not exist before.
/// Fails with [`KvError::WrongType`] if the key holds another value kind.
pub fn add(conn: &Connection, key: &str, items: &[ZMember]) -> Result<usize> {
    if items.is_empty() {
        return Ok(0);
    }
    let key_id = upsert_key(conn, key)?;

    let mut created = 0;
    let mut existing = conn.prepare("select 1 from zset where key_id = :key_id and elem = :elem")?;
    let mut upsert = conn.prepare(
        "insert into zset (key_id, elem, score) values (:key_id, :elem, :score)
         on conflict (key_id, elem) do update set score = excluded.score",
    )?;
    for item in items {
        if !existing.exists(named_params! { ":key_id": key_id, ":elem": item.elem })? {
            created += 1;
        }
        upsert.execute(
            named_params! { ":key_id": key_id, ":elem": item.elem, ":score": item.score },
        )?;
    }
    Ok(created)
}

/// Returns the score of a member, or `None` if the key is missing,
/// expired, of another type, or does not hold the element.
pub fn score(conn: &Connection, key: &str, elem: &[u8]) -> Result<Option<f64>> {
    let score = conn
        .query_row(
            SQL_SCORE,
            named_params! { ":key": key, ":elem": elem, ":now": Db::now_ms() },
            |row| row.get(0),
        )
        .optional()?;
    Ok(score)
}

/// Returns the number of members in a sorted set, 0 when the key is
/// missing, expired or of another type.
pub fn card(conn: &Connection, key: &str) -> Result<i64> {
    let count = conn.query_row(
        SQL_CARD,
        named_params! { ":key": key, ":now": Db::now_ms() },
        |row| row.get(0),
    )?;
    Ok(count)
}

// Finds or creates the live sorted-set row for key, bumping version and
// mtime on an existing one. An expired row still pins the unique name;
// it is logically dead, so it is dropped and replaced with a fresh id.
fn upsert_key(conn: &Connection, key: &str) -> Result<i64> {
    let now = Db::now_ms();
    let row: Option<(i64, i32, Option<i64>)> = conn
        .query_row(
            "select id, type, etime from keys where key = :key",
            named_params! { ":key": key },
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    if let Some((id, type_tag, etime)) = row {
        if etime.map_or(true, |at| at > now) {
            if type_tag != KeyType::ZSet as i32 {
                return Err(KvError::WrongType);
            }
            conn.execute(
                "update keys set version = version + 1, mtime = :now where id = :id",
                named_params! { ":now": now, ":id": id },
            )?;
            return Ok(id);
        }
        conn.execute("delete from keys where id = :id", named_params! { ":id": id })?;
    }

    let id = conn.query_row(
        "insert into keys (key, type, version, mtime) values (:key, :type, 0, :mtime) returning id",
        named_params! { ":key": key, ":type": KeyType::ZSet as i32, ":mtime": now },
        |row| row.get(0),
    )?;
    Ok(id)
}

// Replaces the destination key inside the caller's transaction: clears
// a dead row pinning the name, deletes a live sorted-set destination,
// then inserts the fresh row. A live destination of another type
// survives the typed delete and turns the insert into WrongType.
fn replace_dest(conn: &Connection, dest: &str) -> Result<i64> {
    let now = Db::now_ms();
    conn.execute(
        SQL_DELETE_EXPIRED_DEST,
        named_params! { ":key": dest, ":now": now },
    )?;
    Keys::new(conn).delete_by_type(KeyType::ZSet, &[dest])?;
    conn.query_row(
        SQL_STORE_KEY,
        named_params! {
            ":key": dest,
            ":type": KeyType::ZSet as i32,
            ":version": 0,
            ":mtime": now,
        },
        |row| row.get(0),
    )
    .map_err(error::typed_error)
}

/// Retrieves a range of elements from a sorted set.
///
/// Filter with [`by_rank`](RangeCmd::by_rank) or
/// [`by_score`](RangeCmd::by_score); both ranges are inclusive.
/// If the key does not exist or is not a sorted set, the result is
/// empty.
#[derive(Clone)]
pub struct RangeCmd<'a> {
    handle: Handle<'a>,
    key: String,
    by_rank: Option<(i64, i64)>,
    by_score: Option<(f64, f64)>,
    sort: SortDir,
    offset: i64,
    count: i64,
}

impl<'a> RangeCmd<'a> {
    pub fn new(db: &'a Db, key: impl Into<String>) -> Self {
        Self::with_handle(Handle::Db(db), key)
    }

    /// Runs within the caller's connection or transaction.
    pub fn with_tx(conn: &'a Connection, key: impl Into<String>) -> Self {
        Self::with_handle(Handle::Conn(conn), key)
    }

    fn with_handle(handle: Handle<'a>, key: impl Into<String>) -> Self {
        Self {
            handle,
            key: key.into(),
            by_rank: None,
            by_score: None,
            sort: SortDir::Asc,
            offset: 0,
            count: 0,
        }
    }

    /// Filters by rank range, zero-based and inclusive.
    /// Negative bounds yield an empty result; callers translate
    /// end-relative indexes before getting here.
    pub fn by_rank(mut self, start: i64, stop: i64) -> Self {
        self.by_rank = Some((start, stop));
        self.by_score = None;
        self
    }

    /// Filters by score range, inclusive on both ends.
    pub fn by_score(mut self, low: f64, high: f64) -> Self {
        self.by_score = Some((low, high));
        self.by_rank = None;
        self
    }

    /// Ascending order by (score, elem). The default.
    pub fn asc(mut self) -> Self {
        self.sort = SortDir::Asc;
        self
    }

    /// Descending order by (score, elem).
    pub fn desc(mut self) -> Self {
        self.sort = SortDir::Desc;
        self
    }

    /// Skips the first `offset` elements. Only takes effect when
    /// filtering by score; 0 means no skip.
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Caps the number of elements returned. Only takes effect when
    /// filtering by score; 0 means no cap.
    pub fn count(mut self, count: i64) -> Self {
        self.count = count;
        self
    }

    /// Runs the query and returns matching members in range order.
    pub fn run(&self) -> Result<Vec<ZMember>> {
        self.handle.view(|conn| self.run_in(conn))
    }

    fn run_in(&self, conn: &Connection) -> Result<Vec<ZMember>> {
        if let Some((start, stop)) = self.by_rank {
            return self.range_rank(conn, start, stop);
        }
        if let Some((low, high)) = self.by_score {
            return self.range_score(conn, low, high);
        }
        Ok(Vec::new())
    }

    fn range_rank(&self, conn: &Connection, start: i64, stop: i64) -> Result<Vec<ZMember>> {
        if start < 0 || stop < 0 {
            return Ok(Vec::new());
        }
        let query = sql::with_sort(SQL_RANGE_RANK, self.sort);
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            named_params! {
                ":key": self.key,
                ":now": Db::now_ms(),
                ":start": start,
                ":stop": stop,
            },
            read_member,
        )?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    fn range_score(&self, conn: &Connection, low: f64, high: f64) -> Result<Vec<ZMember>> {
        let mut query = sql::with_sort(SQL_RANGE_SCORE, self.sort);
        query.push_str(sql::limit_clause(self.offset, self.count));

        let mut args: sql::NamedArgs = vec![
            (":key".to_owned(), Box::new(self.key.clone())),
            (":now".to_owned(), Box::new(Db::now_ms())),
            (":start".to_owned(), Box::new(low)),
            (":stop".to_owned(), Box::new(high)),
        ];
        if self.offset > 0 {
            args.push((":offset".to_owned(), Box::new(self.offset)));
        }
        if self.count > 0 {
            args.push((":count".to_owned(), Box::new(self.count)));
        }

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(sql::params_ref(&args).as_slice(), read_member)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }
}

/// Intersects multiple sorted sets.
///
/// The intersection holds the elements present in every source key,
/// each scored by the aggregate of its scores across the sources,
/// ordered by (aggregated score, elem) ascending. A source key that is
/// missing or of another type empties the whole intersection.
#[derive(Clone)]
pub struct InterCmd<'a> {
    handle: Handle<'a>,
    dest: Option<String>,
    keys: Vec<String>,
    agg: Aggregate,
}

impl<'a> InterCmd<'a> {
    pub fn new(db: &'a Db, keys: &[&str]) -> Self {
        Self::with_handle(Handle::Db(db), keys)
    }

    /// Runs within the caller's connection or transaction.
    pub fn with_tx(conn: &'a Connection, keys: &[&str]) -> Self {
        Self::with_handle(Handle::Conn(conn), keys)
    }

    fn with_handle(handle: Handle<'a>, keys: &[&str]) -> Self {
        Self {
            handle,
            dest: None,
            keys: keys.iter().map(|k| (*k).to_owned()).collect(),
            agg: Aggregate::Sum,
        }
    }

    /// Sets the key to store the result in.
    pub fn dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    /// Aggregates shared elements by the sum of their scores. The default.
    pub fn sum(mut self) -> Self {
        self.agg = Aggregate::Sum;
        self
    }

    /// Aggregates shared elements by their minimum score.
    pub fn min(mut self) -> Self {
        self.agg = Aggregate::Min;
        self
    }

    /// Aggregates shared elements by their maximum score.
    pub fn max(mut self) -> Self {
        self.agg = Aggregate::Max;
        self
    }

    /// Returns the intersection of the source sets.
    pub fn run(&self) -> Result<Vec<ZMember>> {
        if self.keys.is_empty() {
            return Ok(Vec::new());
        }
        self.handle.view(|conn| self.run_in(conn))
    }

    fn run_in(&self, conn: &Connection) -> Result<Vec<ZMember>> {
        let query = sql::with_aggregate(SQL_INTER, self.agg);
        let query = sql::expand_in(&query, ":keys", self.keys.len());
        let mut args = sql::in_args(":keys", &self.keys);
        args.push((":now".to_owned(), Box::new(Db::now_ms())));
        args.push((":nkeys".to_owned(), Box::new(self.keys.len() as i64)));

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(sql::params_ref(&args).as_slice(), read_member)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Intersects the source sets and stores the result in the
    /// destination key, replacing it wholly. Returns the number of
    /// members stored. Fails with [`KvError::WrongType`] when a live
    /// destination holds another value kind. When no source contributes
    /// anything, the destination still exists and is empty.
    pub fn store(&self) -> Result<usize> {
        let dest = self
            .dest
            .clone()
            .ok_or_else(|| KvError::Other("destination key is not set".to_owned()))?;
        self.handle.update(|conn| self.store_in(conn, &dest))
    }

    fn store_in(&self, conn: &Connection, dest: &str) -> Result<usize> {
        let dest_id = replace_dest(conn, dest)?;
        if self.keys.is_empty() {
            return Ok(0);
        }

        let query = sql::with_aggregate(SQL_INTER_STORE, self.agg);
        let query = sql::expand_in(&query, ":keys", self.keys.len());
        let mut args = sql::in_args(":keys", &self.keys);
        args.push((":dest_id".to_owned(), Box::new(dest_id)));
        args.push((":now".to_owned(), Box::new(Db::now_ms())));
        args.push((":nkeys".to_owned(), Box::new(self.keys.len() as i64)));

        let stored = conn.execute(&query, sql::params_ref(&args).as_slice())?;
        tracing::debug!(dest, stored, "stored sorted-set intersection");
        Ok(stored)
    }
}

/// Unions multiple sorted sets.
///
/// The union holds the elements present in at least one source key,
/// each scored by the aggregate of its scores across the sources where
/// it occurs, ordered by (aggregated score, elem) ascending. Missing
/// source keys are skipped.
#[derive(Clone)]
pub struct UnionCmd<'a> {
    handle: Handle<'a>,
    dest: Option<String>,
    keys: Vec<String>,
    agg: Aggregate,
}

impl<'a> UnionCmd<'a> {
    pub fn new(db: &'a Db, keys: &[&str]) -> Self {
        Self::with_handle(Handle::Db(db), keys)
    }

    /// Runs within the caller's connection or transaction.
    pub fn with_tx(conn: &'a Connection, keys: &[&str]) -> Self {
        Self::with_handle(Handle::Conn(conn), keys)
    }

    fn with_handle(handle: Handle<'a>, keys: &[&str]) -> Self {
        Self {
            handle,
            dest: None,
            keys: keys.iter().map(|k| (*k).to_owned()).collect(),
            agg: Aggregate::Sum,
        }
    }

    /// Sets the key to store the result in.
    pub fn dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    /// Aggregates shared elements by the sum of their scores. The default.
    pub fn sum(mut self) -> Self {
        self.agg = Aggregate::Sum;
        self
    }

    /// Aggregates shared elements by their minimum score.
    pub fn min(mut self) -> Self {
        self.agg = Aggregate::Min;
        self
    }

    /// Aggregates shared elements by their maximum score.
    pub fn max(mut self) -> Self {
        self.agg = Aggregate::Max;
        self
    }

    /// Returns the union of the source sets.
    pub fn run(&self) -> Result<Vec<ZMember>> {
        if self.keys.is_empty() {
            return Ok(Vec::new());
        }
        self.handle.view(|conn| self.run_in(conn))
    }

    fn run_in(&self, conn: &Connection) -> Result<Vec<ZMember>> {
        let query = sql::with_aggregate(SQL_UNION, self.agg);
        let query = sql::expand_in(&query, ":keys", self.keys.len());
        let mut args = sql::in_args(":keys", &self.keys);
        args.push((":now".to_owned(), Box::new(Db::now_ms())));

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(sql::params_ref(&args).as_slice(), read_member)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Unions the source sets and stores the result in the destination
    /// key, replacing it wholly. Returns the number of members stored.
    /// Fails with [`KvError::WrongType`] when a live destination holds
    /// another value kind. When no source contributes anything, the
    /// destination still exists and is empty.
    pub fn store(&self) -> Result<usize> {
        let dest = self
            .dest
            .clone()
            .ok_or_else(|| KvError::Other("destination key is not set".to_owned()))?;
        self.handle.update(|conn| self.store_in(conn, &dest))
    }

    fn store_in(&self, conn: &Connection, dest: &str) -> Result<usize> {
        let dest_id = replace_dest(conn, dest)?;
        if self.keys.is_empty() {
            return Ok(0);
        }

        let query = sql::with_aggregate(SQL_UNION_STORE, self.agg);
        let query = sql::expand_in(&query, ":keys", self.keys.len());
        let mut args = sql::in_args(":keys", &self.keys);
        args.push((":dest_id".to_owned(), Box::new(dest_id)));
        args.push((":now".to_owned(), Box::new(Db::now_ms())));

        let stored = conn.execute(&query, sql::params_ref(&args).as_slice())?;
        tracing::debug!(dest, stored, "stored sorted-set union");
        Ok(stored)
    }
}
