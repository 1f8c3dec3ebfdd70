use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found")]
    NotFound,

    #[error("wrong type for key")]
    WrongType,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

/// Classifies a store error raised while inserting a destination key.
///
/// A live destination of the wrong kind survives the type-filtered delete
/// that precedes a store, so the fresh insert collides on the key name
/// unique constraint. That constraint failure means "wrong type" to callers.
pub(crate) fn typed_error(err: rusqlite::Error) -> KvError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return KvError::WrongType;
        }
    }
    KvError::Sqlite(err)
}
