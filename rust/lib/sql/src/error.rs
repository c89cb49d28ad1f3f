use thiserror::Error;

/// Errors reported by a [`SQLStore`](crate::SQLStore) backend.
///
/// Backends classify engine failures into these variants at the boundary
/// so callers can tell input problems (`Syntax`, `Constraint`, `ReadOnly`,
/// `Denied`) from infrastructure problems (`Connection`, `Query`, `Execution`).
#[derive(Error, Debug)]
pub enum SQLError {
    #[error("query error: {0}")]
    Query(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// The statement text was rejected by the engine's parser or planner.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// A UNIQUE / NOT NULL / CHECK / FOREIGN KEY constraint failed.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A write was attempted inside a read-only transaction.
    #[error("read-only violation: {0}")]
    ReadOnly(String),

    /// The statement touched something outside the transaction's read scope.
    #[error("not authorized: {0}")]
    Denied(String),

    /// The statement was interrupted because its deadline passed.
    #[error("interrupted: {0}")]
    Interrupted(String),
}
