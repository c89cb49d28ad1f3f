use std::time::Instant;

use crate::error::SQLError;

/// A dynamically-typed SQL parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    /// A set of integers bound as one parameter.
    ///
    /// Only valid as a bound parameter, never returned in a [`Row`]. The
    /// SQLite backend exposes it to SQL as `rarray(?N)`.
    IntArray(Vec<i64>),
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        match v {
            Some(s) => Value::Text(s),
            None => Value::Null,
        }
    }
}

/// A row returned from a SQL query, keyed by column name.
#[derive(Debug, Clone)]
pub struct Row {
    pub columns: Vec<(String, Value)>,
}

impl Row {
    /// Get a column value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Get a text column value by name.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get an integer column value by name.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    /// Get a real column value by name.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(Value::Real(f)) => Some(*f),
            _ => None,
        }
    }
}

/// Options for [`SQLStore::begin`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    /// Reject every write for the lifetime of the transaction.
    pub read_only: bool,

    /// Interrupt any statement still running at this instant.
    pub deadline: Option<Instant>,

    /// When set, statements may only read these tables; anything else is
    /// refused at prepare time with [`SQLError::Denied`].
    pub read_scope: Option<&'static [&'static str]>,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_read_scope(mut self, tables: &'static [&'static str]) -> Self {
        self.read_scope = Some(tables);
        self
    }
}

/// An open transaction.
///
/// Dropping a transaction that was neither committed nor rolled back
/// rolls it back. Implementations must also undo any connection state
/// installed by [`TxOptions`] on every exit path.
pub trait SQLTx {
    /// Execute a query inside the transaction and return rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError>;

    /// Execute a statement inside the transaction and return affected row count.
    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, SQLError>;

    fn commit(self: Box<Self>) -> Result<(), SQLError>;

    fn rollback(self: Box<Self>) -> Result<(), SQLError>;
}

/// SQLStore provides a SQL execution interface backed by an embedded database.
pub trait SQLStore: Send + Sync {
    /// Execute a single-statement query and return rows.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError>;

    /// Execute a statement (INSERT/UPDATE/DELETE) and return affected row count.
    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError>;

    /// Execute one or more `;`-separated statements without parameters.
    /// Intended for trusted DDL only.
    fn exec_batch(&self, sql: &str) -> Result<(), SQLError>;

    /// Begin a transaction. The returned handle keeps exclusive use of
    /// the underlying connection until it is finished or dropped.
    fn begin(&self, opts: TxOptions) -> Result<Box<dyn SQLTx + '_>, SQLError>;
}
