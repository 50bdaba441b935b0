use std::io;

/// Typed errors used between the engine layers. The query boundary
/// collapses all of them to the false/empty convention; only the
/// transaction runner distinguishes them (a `Conflict` is retried).
#[derive(Debug)]
pub enum EngineError {
    /// RID absent, tombstoned, or key missing from an index.
    NotFound,
    /// Duplicate primary key, arity mismatch, or key change onto an
    /// existing key.
    IntegrityViolation(String),
    /// Lock acquisition denied; recoverable via transaction retry.
    Conflict,
    /// Slot access outside a page's populated region: the page directory
    /// disagrees with the page, fatal for the operation.
    BoundsViolation,
    /// Disk I/O failure.
    Persistence(io::Error),
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Persistence(err)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
