//! Read-only execution of operator-authored filter expressions.
//!
//! A filter is opaque SQL embedded as a WHERE clause. What keeps it from
//! doing harm is the execution mode: it only ever runs as a single COUNT
//! statement inside a read-only transaction that may read nothing but
//! subscriber data, and that transaction is rolled back on every exit path.
//! A result that is not one non-negative `total` is refused.

use std::time::Instant;

use audience_core::ServiceError;
use audience_sql::{Row, SQLError, SQLStore, TxOptions};
use tracing::{debug, error};

/// Placeholder in a count template replaced by the filter clause.
pub const COND_TOKEN: &str = "%cond%";

/// Count of subscribers matching a filter.
pub const COUNT_SUBSCRIBERS_BY_QUERY: &str = "SELECT COUNT(*) AS total FROM subscribers %cond%";

/// Tables a filter may read. `json_each`/`json_tree` serve attribute lookups.
pub const READABLE_TABLES: &[&str] = &["subscribers", "json_each", "json_tree"];

/// `WHERE (<expr>)` for a non-blank expression, nothing otherwise.
///
/// The closing parenthesis sits on its own line so a trailing `--` comment
/// in the expression cannot swallow it.
pub fn filter_clause(expr: &str) -> String {
    let expr = expr.trim();
    if expr.is_empty() {
        String::new()
    } else {
        format!("WHERE ({expr}\n)")
    }
}

/// Run `template` with `expr` as its filter and return the `total` column.
///
/// The statement runs in a read-only transaction that may only read
/// [`READABLE_TABLES`], bounded by `deadline`.
/// Input-caused failures come back as `QuerySyntax` or `ReadOnly`, a
/// passed deadline as `Timeout`, everything else as `Storage`.
pub fn count_read_only(
    db: &dyn SQLStore,
    template: &str,
    expr: &str,
    deadline: Option<Instant>,
) -> Result<i64, ServiceError> {
    let stmt = template.replace(COND_TOKEN, &filter_clause(expr));

    // Filters can embed attribute values; only their size is logged.
    debug!(
        filter_len = expr.len(),
        has_deadline = deadline.is_some(),
        "counting subscribers by filter"
    );

    let opts = TxOptions::read_only()
        .with_deadline(deadline)
        .with_read_scope(READABLE_TABLES);
    let mut tx = db.begin(opts).map_err(guard_err)?;

    // On error the transaction is dropped, which rolls it back.
    let rows = tx.query(&stmt, &[]).map_err(guard_err)?;
    tx.rollback().map_err(guard_err)?;

    single_total(&rows).ok_or_else(|| {
        ServiceError::QuerySyntax("invalid segment query: it must not alter the count".into())
    })
}

/// The count from a result of exactly one row holding one integer `total`.
fn single_total(rows: &[Row]) -> Option<i64> {
    match rows {
        [row] if row.columns.len() == 1 => row.get_i64("total").filter(|n| *n >= 0),
        _ => None,
    }
}

fn guard_err(e: SQLError) -> ServiceError {
    match e {
        SQLError::Syntax(msg) => ServiceError::QuerySyntax(format!("invalid segment query: {msg}")),
        SQLError::ReadOnly(_) => {
            ServiceError::ReadOnly("segment query attempted to modify data".into())
        }
        SQLError::Denied(_) => ServiceError::QuerySyntax(
            "invalid segment query: only subscriber data can be referenced".into(),
        ),
        SQLError::Interrupted(_) => {
            ServiceError::Timeout("subscriber count exceeded its deadline".into())
        }
        other => {
            error!("error counting subscribers: {other}");
            ServiceError::Storage("error counting subscribers".into())
        }
    }
}
