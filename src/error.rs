//! Centralized error taxonomy. Unrecoverable storage errors do not flow
//! through this enum at all — see [`fatal`].

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    // --- storage / file ---
    #[error("file already exists: {0}")]
    FileExists(String),
    #[error("file does not exist: {0}")]
    FileNotExists(String),
    #[error("cannot read/write file: {0}")]
    FileCannotRW(String),
    #[error("XID file is corrupted")]
    BadXidFile,
    #[error("log file is corrupted")]
    BadLogFile,
    #[error("memory/cache size too small")]
    MemTooSmall,
    #[error("data item too large for a page")]
    DataTooLarge,
    #[error("database busy, no free page available")]
    DatabaseBusy,

    // --- logical ---
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("invalid values")]
    InvalidValues,
    #[error("invalid log operation")]
    InvalidLogOp,
    #[error("field not found: {0}")]
    FieldNotFound(String),
    #[error("field not indexed: {0}")]
    FieldNotIndexed(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("table has no index")]
    TableNoIndex,
    #[error("table already exists: {0}")]
    DuplicatedTable(String),
    #[error("entry does not exist")]
    NullEntry,
    #[error("invalid package data")]
    InvalidPkgData,
    #[error("not implemented: {0}")]
    NotImplemented(String),

    // --- concurrency ---
    #[error("concurrent update conflict")]
    ConcurrentUpdate,
    #[error("deadlock detected")]
    Deadlock,
    #[error("nested transaction not allowed")]
    NestedTransaction,
    #[error("no transaction in progress")]
    NoTransaction,

    // --- cache ---
    #[error("cache is full")]
    CacheFull,

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Surfaces an unrecoverable storage error: logs it and aborts the process.
/// Corrupt XID files, failed fsyncs, and log corruption past the bad-tail
/// point mean the core cannot continue safely; an ordinary `Err` would let a
/// caller paper over a broken on-disk invariant.
pub fn fatal(msg: impl AsRef<str>) -> ! {
    tracing::error!(error = msg.as_ref(), "unrecoverable storage error, aborting");
    std::process::abort();
}
