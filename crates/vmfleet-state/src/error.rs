use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Store failures. redb's error types are flattened to strings so callers
/// above the store never depend on redb directly.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open fleet database: {0}")]
    Open(String),

    #[error("cannot begin transaction: {0}")]
    Begin(String),

    #[error("cannot commit transaction: {0}")]
    Commit(String),

    #[error("cannot open table: {0}")]
    Table(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    /// A row did not round-trip through JSON.
    #[error("bad record encoding: {0}")]
    Codec(String),
}
