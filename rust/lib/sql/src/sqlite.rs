use std::path::Path;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rusqlite::functions::FunctionFlags;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::types::{ToSql, ValueRef};
use rusqlite::{Batch, Connection, ErrorCode, Statement};
use tracing::{debug, warn};

use crate::error::SQLError;
use crate::traits::{Row, SQLStore, SQLTx, TxOptions, Value};

/// How many VM instructions SQLite runs between deadline checks.
const PROGRESS_OPS: i32 = 1_000;

/// SqliteStore is a SQLStore implementation backed by rusqlite (bundled SQLite).
///
/// A single connection is shared behind a mutex; transactions hold the
/// lock until they finish, so nothing interleaves with them.
///
/// Besides the built-ins, SQL can call `rarray(?)` and `unicode_lower(text)`,
/// a full Unicode lowercase (SQLite's own `lower()` only folds ASCII).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self, SQLError> {
        let conn = Connection::open(path).map_err(|e| SQLError::Connection(e.to_string()))?;

        // Enable WAL mode for better concurrent read performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| SQLError::Connection(e.to_string()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| SQLError::Connection(e.to_string()))?;

        Self::from_connection(conn)
    }

    /// Create an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self, SQLError> {
        let conn =
            Connection::open_in_memory().map_err(|e| SQLError::Connection(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, SQLError> {
        // Registers `rarray()`, the table-valued function behind Value::IntArray.
        rusqlite::vtab::array::load_module(&conn)
            .map_err(|e| SQLError::Connection(e.to_string()))?;
        conn.create_scalar_function(
            "unicode_lower",
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| {
                let text = ctx
                    .get_raw(0)
                    .as_str_or_null()
                    .map_err(|e| rusqlite::Error::UserFunctionError(e.into()))?;
                Ok(text.map(str::to_lowercase))
            },
        )
        .map_err(|e| SQLError::Connection(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SQLError> {
        self.conn
            .lock()
            .map_err(|e| SQLError::Connection(e.to_string()))
    }
}

impl SQLStore for SqliteStore {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        let conn = self.lock()?;
        run_query(&conn, sql, params)
    }

    fn exec(&self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        let conn = self.lock()?;
        run_exec(&conn, sql, params)
    }

    fn exec_batch(&self, sql: &str) -> Result<(), SQLError> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| classify(e, SQLError::Execution))
    }

    fn begin(&self, opts: TxOptions) -> Result<Box<dyn SQLTx + '_>, SQLError> {
        let conn = self.lock()?;

        // From here on, Drop undoes whatever connection state was installed.
        let mut tx = SqliteTx {
            conn,
            opts,
            finished: true,
        };

        if opts.read_only {
            tx.conn
                .execute_batch("PRAGMA query_only = ON;")
                .map_err(|e| classify(e, SQLError::Execution))?;
        }
        if let Some(deadline) = opts.deadline {
            tx.conn
                .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= deadline));
        }

        tx.conn
            .execute_batch("BEGIN;")
            .map_err(|e| classify(e, SQLError::Execution))?;
        tx.finished = false;

        if let Some(tables) = opts.read_scope {
            tx.conn
                .authorizer(Some(move |ctx: AuthContext<'_>| authorize_read(tables, ctx)));
        }

        debug!(
            read_only = opts.read_only,
            deadline = opts.deadline.is_some(),
            read_scope = ?opts.read_scope,
            "sqlite transaction started"
        );
        Ok(Box::new(tx))
    }
}

/// An open SQLite transaction holding the connection lock.
struct SqliteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    opts: TxOptions,
    finished: bool,
}

impl SqliteTx<'_> {
    fn clear_hooks(&self) {
        if self.opts.deadline.is_some() {
            self.conn.progress_handler(0, None::<fn() -> bool>);
        }
        if self.opts.read_scope.is_some() {
            self.conn
                .authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
        }
    }

    fn finish(&mut self, stmt: &str) -> Result<(), SQLError> {
        self.clear_hooks();
        self.finished = true;
        self.conn
            .execute_batch(stmt)
            .map_err(|e| classify(e, SQLError::Execution))
    }
}

impl SQLTx for SqliteTx<'_> {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
        run_query(&self.conn, sql, params)
    }

    fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
        run_exec(&self.conn, sql, params)
    }

    fn commit(mut self: Box<Self>) -> Result<(), SQLError> {
        self.finish("COMMIT;")
    }

    fn rollback(mut self: Box<Self>) -> Result<(), SQLError> {
        self.finish("ROLLBACK;")
    }
}

impl Drop for SqliteTx<'_> {
    fn drop(&mut self) {
        self.clear_hooks();

        if !self.finished {
            if let Err(e) = self.conn.execute_batch("ROLLBACK;") {
                // Fails harmlessly when SQLite already rolled back on its own.
                debug!("sqlite rollback on drop: {e}");
            }
        }

        if self.opts.read_only {
            if let Err(e) = self.conn.execute_batch("PRAGMA query_only = OFF;") {
                warn!("failed to clear query_only on sqlite connection: {e}");
            }
        }
    }
}

/// Authorizer for a scoped transaction: plain SELECTs over `tables`.
fn authorize_read(tables: &[&str], ctx: AuthContext<'_>) -> Authorization {
    match ctx.action {
        AuthAction::Select | AuthAction::Function { .. } | AuthAction::Recursive => {
            Authorization::Allow
        }
        AuthAction::Read { table_name, .. } if tables.iter().any(|t| *t == table_name) => {
            Authorization::Allow
        }
        _ => Authorization::Deny,
    }
}

/// Prepare `sql`, which must hold exactly one statement.
///
/// `prepare` alone stops at the first statement and ignores the rest.
fn prepare_single<'c>(
    conn: &'c Connection,
    sql: &str,
    fallback: fn(String) -> SQLError,
) -> Result<Statement<'c>, SQLError> {
    let mut batch = Batch::new(conn, sql);
    let stmt = batch
        .next()
        .map_err(|e| classify(e, fallback))?
        .ok_or_else(|| SQLError::Syntax("empty statement".into()))?;
    if batch.next().map_err(|e| classify(e, fallback))?.is_some() {
        return Err(SQLError::Syntax(
            "multiple statements are not allowed here".into(),
        ));
    }
    Ok(stmt)
}

/// Convert our Value enum to rusqlite's ToSql.
fn bind_params(params: &[Value]) -> Vec<Box<dyn ToSql + '_>> {
    params
        .iter()
        .map(|v| -> Box<dyn ToSql + '_> {
            match v {
                Value::Null => Box::new(rusqlite::types::Null),
                Value::Integer(i) => Box::new(*i),
                Value::Real(f) => Box::new(*f),
                Value::Text(s) => Box::new(s.as_str()),
                Value::Blob(b) => Box::new(b.as_slice()),
                Value::IntArray(ids) => Box::new(Rc::new(
                    ids.iter()
                        .copied()
                        .map(rusqlite::types::Value::from)
                        .collect::<Vec<_>>(),
                )),
            }
        })
        .collect()
}

fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>, SQLError> {
    let bound = bind_params(params);
    let param_refs: Vec<&dyn ToSql> = bound.iter().map(|b| b.as_ref()).collect();

    let mut stmt = prepare_single(conn, sql, SQLError::Query)?;

    let column_names: Vec<String> = stmt
        .column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();

    let rows = stmt
        .query_map(param_refs.as_slice(), |row| {
            let mut columns = Vec::with_capacity(column_names.len());
            for (i, name) in column_names.iter().enumerate() {
                columns.push((name.clone(), row_value_at(row, i)?));
            }
            Ok(Row { columns })
        })
        .map_err(|e| classify(e, SQLError::Query))?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(|e| classify(e, SQLError::Query))?);
    }
    Ok(result)
}

fn run_exec(conn: &Connection, sql: &str, params: &[Value]) -> Result<u64, SQLError> {
    let bound = bind_params(params);
    let param_refs: Vec<&dyn ToSql> = bound.iter().map(|b| b.as_ref()).collect();

    let mut stmt = prepare_single(conn, sql, SQLError::Execution)?;
    let affected = stmt
        .execute(param_refs.as_slice())
        .map_err(|e| classify(e, SQLError::Execution))?;

    Ok(affected as u64)
}

/// Extract a Value from a rusqlite row at a given column index.
fn row_value_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Value> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    })
}

/// Map a rusqlite error onto the SQLError taxonomy.
///
/// `fallback` wraps anything that is not one of the recognised classes.
fn classify(e: rusqlite::Error, fallback: fn(String) -> SQLError) -> SQLError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::ConstraintViolation => SQLError::Constraint(e.to_string()),
            ErrorCode::ReadOnly => SQLError::ReadOnly(e.to_string()),
            ErrorCode::OperationInterrupted => SQLError::Interrupted(e.to_string()),
            ErrorCode::AuthorizationForStatementDenied => SQLError::Denied(e.to_string()),
            // SQLITE_ERROR: parse errors, unknown tables/columns, bad functions.
            ErrorCode::Unknown | ErrorCode::TypeMismatch => SQLError::Syntax(e.to_string()),
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::SystemIoFailure
            | ErrorCode::DiskFull
            | ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked => SQLError::Connection(e.to_string()),
            _ => fallback(e.to_string()),
        },
        rusqlite::Error::MultipleStatement | rusqlite::Error::InvalidParameterCount(..) => {
            SQLError::Syntax(e.to_string())
        }
        _ => fallback(e.to_string()),
    }
}
