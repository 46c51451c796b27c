use thiserror::Error;

/// Error type for all public `snapdb` operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Incompatible option combination passed to [`crate::Db::load`].
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    /// Mutating call on a database opened in read-only mode.
    #[error("db is read-only")]
    ReadOnly,
    /// `set_initial_version` after the first commit.
    #[error("initial version can only be set before any commit")]
    AlreadyCommitted,
    /// The requested target version is older than any retained snapshot.
    #[error("target version {0} is pruned")]
    TargetPruned(u64),
    /// A background snapshot rewrite is already running.
    #[error("another snapshot rewrite is in progress")]
    RewriteInProgress,
    /// The async WAL writer terminated with an error; the DB must be abandoned.
    #[error("async wal writer quit unexpectedly: {0}")]
    AsyncWalFailed(#[source] Box<DbError>),
    /// Snapshot write interrupted by cancellation.
    #[error("snapshot write cancelled")]
    Cancelled,
    /// WAL shape violation: non-contiguous append or a missing index.
    #[error("wal: {0}")]
    Wal(String),
    /// Unknown store name, duplicate tree, or similar structural misuse.
    #[error("{0}")]
    InvalidArgument(String),
    /// Snapshot or WAL payload failed structural validation.
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        DbError::InvalidArgument(msg.into())
    }

    pub(crate) fn wal(msg: impl Into<String>) -> Self {
        DbError::Wal(msg.into())
    }
}
