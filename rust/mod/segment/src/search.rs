//! Listing statement composition: validated ordering plus a bound search
//! pattern.
//!
//! Column names cannot be bound as parameters, so the only text that is
//! ever spliced into a statement is a column from a fixed allow-list and
//! one of two direction keywords. The search string only ever becomes a
//! parameter value.

/// Placeholder in a statement template replaced by `<column> <direction>`.
pub const ORDER_TOKEN: &str = "%order%";

/// Placeholder replaced by the bare direction, for tiebreaker columns.
pub const DIRECTION_TOKEN: &str = "%dir%";

/// Column used when the requested one is not allowed.
pub const DEFAULT_ORDER_COLUMN: &str = "created_at";

/// Escape character used in the generated LIKE patterns. Statements must
/// declare it with `ESCAPE '\'`.
pub const LIKE_ESCAPE: char = '\\';

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// Parse a direction case-insensitively. Anything else is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("asc") {
            Some(Self::Asc)
        } else if s.eq_ignore_ascii_case("desc") {
            Some(Self::Desc)
        } else {
            None
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Output of [`make_search_query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Final statement text with the ordering substituted.
    pub statement: String,
    /// LIKE pattern to bind as the search parameter.
    pub pattern: String,
}

/// Build a listing statement from `base` and the caller's raw search and
/// sort inputs.
///
/// Never fails: an `order_by` outside `allowed_columns` falls back to
/// [`DEFAULT_ORDER_COLUMN`], an unknown `order` falls back to descending.
pub fn make_search_query(
    search: &str,
    order_by: &str,
    order: &str,
    allowed_columns: &[&str],
    base: &str,
) -> SearchQuery {
    let column = allowed_columns
        .iter()
        .copied()
        .find(|c| *c == order_by)
        .unwrap_or(DEFAULT_ORDER_COLUMN);
    let direction = SortOrder::parse(order).unwrap_or_default();

    SearchQuery {
        statement: base
            .replace(ORDER_TOKEN, &format!("{column} {}", direction.as_sql()))
            .replace(DIRECTION_TOKEN, direction.as_sql()),
        pattern: like_pattern(search),
    }
}

/// Turn free text into a substring LIKE pattern that matches it literally.
///
/// The pattern is lowercased; statements compare it against
/// `unicode_lower(<column>)`. Blank input yields `%`, which matches
/// everything.
pub fn like_pattern(search: &str) -> String {
    let search = search.trim().to_lowercase();
    if search.is_empty() {
        return "%".to_string();
    }

    let mut out = String::with_capacity(search.len() + 2);
    out.push('%');
    for ch in search.chars() {
        if ch == '%' || ch == '_' || ch == LIKE_ESCAPE {
            out.push(LIKE_ESCAPE);
        }
        out.push(ch);
    }
    out.push('%');
    out
}
