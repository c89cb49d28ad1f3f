use audience_core::ServiceError;
use audience_sql::SQLStore;

/// SQL DDL for the segment module.
///
/// `subscribers` belongs to the wider system; it is created here only when
/// absent so segment filters have something to run against.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS segments (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid            TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    segment_query   TEXT NOT NULL DEFAULT '',
    description     TEXT,
    created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_segments_name ON segments(name);
CREATE INDEX IF NOT EXISTS idx_segments_created_at ON segments(created_at);

CREATE TABLE IF NOT EXISTS subscribers (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid        TEXT NOT NULL UNIQUE,
    email       TEXT NOT NULL UNIQUE,
    name        TEXT NOT NULL,
    attribs     TEXT NOT NULL DEFAULT '{}',
    status      TEXT NOT NULL DEFAULT 'enabled',
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_subscribers_status ON subscribers(status);
";

/// Create the segment tables if they do not exist yet.
pub fn init(db: &dyn SQLStore) -> Result<(), ServiceError> {
    db.exec_batch(SCHEMA)
        .map_err(|e| ServiceError::Storage(format!("segment schema init: {e}")))
}
