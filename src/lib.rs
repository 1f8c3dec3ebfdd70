//! Scorelite - SQLite-backed Redis-compatible key and sorted-set core
//!
//! The crate keeps every user-visible key in a typed, versioned,
//! TTL-aware registry and stores sorted sets relationally, with ranged
//! lookups and multi-key set algebra (intersection, union) pushed down
//! into SQL.
//!
//! # Example
//!
//! ```
//! use scorelite::{Db, ZMember};
//!
//! let db = Db::open_memory().unwrap();
//!
//! // ZADD/ZRANGE
//! db.zadd("race", &[ZMember::new(9.5, "ann"), ZMember::new(7.1, "bob")])
//!     .unwrap();
//! let podium = db.zrange("race").by_rank(0, 1).desc().run().unwrap();
//! assert_eq!(podium[0].elem, b"ann".to_vec());
//!
//! // ZINTERSTORE
//! db.zadd("heat", &[ZMember::new(1.0, "ann")]).unwrap();
//! let stored = db.zinter(&["race", "heat"]).dest("final").store().unwrap();
//! assert_eq!(stored, 1);
//! ```

pub mod db;
pub mod error;
pub mod keys;
mod sql;
pub mod types;
pub mod zset;

pub use db::Db;
pub use error::{KvError, Result};
pub use keys::{Keys, ScanResult, Scanner};
pub use types::{Key, KeyType, ZMember};
pub use zset::{InterCmd, RangeCmd, UnionCmd};
