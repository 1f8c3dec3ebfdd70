#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KeyType {
    String = 1,
    Hash = 2,
    List = 3,
    Set = 4,
    ZSet = 5,
    Stream = 6,
}

impl KeyType {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(KeyType::String),
            2 => Some(KeyType::Hash),
            3 => Some(KeyType::List),
            4 => Some(KeyType::Set),
            5 => Some(KeyType::ZSet),
            6 => Some(KeyType::Stream),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::Hash => "hash",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::ZSet => "zset",
            KeyType::Stream => "stream",
        }
    }
}

/// A key record with all registry metadata.
///
/// A record is live while `etime` is absent or still in the future;
/// expired records are invisible to every operation until reaped.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub id: i64,
    pub key: String,
    pub type_tag: i32,
    pub version: i64,
    pub etime: Option<i64>,
    pub mtime: i64,
}

impl Key {
    pub fn key_type(&self) -> Option<KeyType> {
        KeyType::from_i32(self.type_tag)
    }

    /// Remaining time to live in milliseconds relative to `now`.
    /// `None` means the key never expires.
    pub fn ttl(&self, now: i64) -> Option<i64> {
        self.etime.map(|at| at - now)
    }
}

/// A sorted-set member: element bytes plus score.
#[derive(Debug, Clone, PartialEq)]
pub struct ZMember {
    pub score: f64,
    pub elem: Vec<u8>,
}

impl ZMember {
    pub fn new(score: f64, elem: impl Into<Vec<u8>>) -> Self {
        Self {
            score,
            elem: elem.into(),
        }
    }
}
