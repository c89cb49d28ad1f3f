use std::sync::Arc;
use std::time::Instant;

use audience_core::{ListResult, ServiceError, new_uuid};
use audience_sql::{Row, SQLError, SQLStore, Value};
use tracing::{error, info};

use crate::config::SegmentConfig;
use crate::guard::{self, COUNT_SUBSCRIBERS_BY_QUERY};
use crate::model::{Segment, SegmentInput};
use crate::schema;
use crate::search::make_search_query;

/// Columns a segment listing may be ordered by.
pub const SORT_COLUMNS: &[&str] = &["name", "created_at", "updated_at"];

/// All segments, no totals. Used for selectors that need every segment.
const GET_SEGMENTS: &str = "SELECT id, uuid, name, segment_query, description, created_at, updated_at \
     FROM segments ORDER BY id";

/// Single lookup (?1 id, ?2 uuid) or search (?3 lowercased pattern), paged
/// by ?4 offset and ?5 limit (< 1 = no limit). `%order%` and `%dir%` are
/// substituted by the search composer.
const QUERY_SEGMENTS: &str = r"
SELECT COUNT(*) OVER () AS total,
       id, uuid, name, segment_query, description, created_at, updated_at
FROM segments
WHERE CASE
    WHEN ?1 > 0 THEN id = ?1
    WHEN ?2 IS NOT NULL THEN uuid = ?2
    ELSE unicode_lower(name) LIKE ?3 ESCAPE '\'
END
ORDER BY %order%, id %dir%
LIMIT (CASE WHEN ?5 < 1 THEN -1 ELSE ?5 END) OFFSET ?4";

const CREATE_SEGMENT: &str = "INSERT INTO segments (uuid, name, segment_query, description) \
     VALUES (?1, ?2, ?3, ?4) RETURNING id";

const UPDATE_SEGMENT: &str = "UPDATE segments \
     SET name = ?2, segment_query = ?3, description = ?4, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
     WHERE id = ?1";

const DELETE_SEGMENTS: &str = "DELETE FROM segments WHERE id IN rarray(?1)";

/// Persistent storage for segments, backed by SQLStore (SQLite).
///
/// Stateless apart from the shared store handle; safe to share across
/// request tasks.
pub struct SegmentStore {
    db: Arc<dyn SQLStore>,
    config: SegmentConfig,
}

impl SegmentStore {
    /// Create a new SegmentStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>, config: SegmentConfig) -> Result<Self, ServiceError> {
        schema::init(db.as_ref())?;
        Ok(Self { db, config })
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Every segment, ordered by id, without totals.
    pub fn list(&self) -> Result<Vec<Segment>, ServiceError> {
        let rows = self
            .db
            .query(GET_SEGMENTS, &[])
            .map_err(|e| storage_err("fetching", e))?;

        rows.iter().map(row_to_segment).collect()
    }

    /// Search, order and page segments.
    ///
    /// Every returned segment carries the size of the whole matching set in
    /// `total`, which is also the result's `total` (0 for an empty page).
    /// `limit == 0` returns everything from `offset` on.
    pub fn query(
        &self,
        search: &str,
        order_by: &str,
        order: &str,
        offset: usize,
        limit: usize,
    ) -> Result<ListResult<Segment>, ServiceError> {
        let q = make_search_query(search, order_by, order, SORT_COLUMNS, QUERY_SEGMENTS);

        let rows = self
            .db
            .query(
                &q.statement,
                &[
                    Value::Integer(0),
                    Value::Null,
                    Value::Text(q.pattern),
                    Value::Integer(to_i64(offset)),
                    Value::Integer(to_i64(limit)),
                ],
            )
            .map_err(|e| storage_err("fetching", e))?;

        let items = rows
            .iter()
            .map(row_to_segment)
            .collect::<Result<Vec<_>, _>>()?;
        let total = items.first().and_then(|s| s.total).unwrap_or(0) as usize;

        Ok(ListResult { items, total })
    }

    /// Fetch one segment by exactly one of `id` (> 0) or `uuid` (non-blank).
    pub fn get(&self, id: Option<i64>, uuid: Option<&str>) -> Result<Segment, ServiceError> {
        let id = id.filter(|i| *i > 0);
        let uuid = uuid.map(str::trim).filter(|u| !u.is_empty());

        let (id_param, uuid_param) = match (id, uuid) {
            (Some(id), None) => (Value::Integer(id), Value::Null),
            (None, Some(uuid)) => (Value::Integer(0), Value::Text(uuid.to_string())),
            (None, None) => {
                return Err(ServiceError::Validation(
                    "segment id or uuid is required".into(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(ServiceError::Validation(
                    "specify either a segment id or a uuid, not both".into(),
                ));
            }
        };

        let q = make_search_query("", "", "", &[], QUERY_SEGMENTS);
        let rows = self
            .db
            .query(
                &q.statement,
                &[
                    id_param,
                    uuid_param,
                    Value::Text(q.pattern),
                    Value::Integer(0),
                    Value::Integer(1),
                ],
            )
            .map_err(|e| storage_err("fetching", e))?;

        let row = rows.first().ok_or_else(|| match (id, uuid) {
            (Some(id), _) => ServiceError::NotFound(format!("segment {id} not found")),
            (_, Some(uuid)) => ServiceError::NotFound(format!("segment {uuid} not found")),
            _ => ServiceError::NotFound("segment not found".into()),
        })?;

        let mut segment = row_to_segment(row)?;
        segment.total = None;
        Ok(segment)
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    /// Insert a new segment and return it as stored.
    pub fn create(&self, input: &SegmentInput) -> Result<Segment, ServiceError> {
        input.validate(self.config.name_max_len)?;

        let rows = self
            .db
            .query(
                CREATE_SEGMENT,
                &[
                    Value::Text(new_uuid()),
                    Value::Text(input.name.trim().to_string()),
                    Value::Text(input.segment_query.clone()),
                    Value::from(input.description.clone()),
                ],
            )
            .map_err(|e| storage_err("creating", e))?;

        let id = rows
            .first()
            .and_then(|r| r.get_i64("id"))
            .ok_or_else(|| ServiceError::Internal("segment insert returned no id".into()))?;
        info!(segment_id = id, "segment created");

        // Not atomic with the insert: a concurrent delete surfaces as NotFound.
        self.get(Some(id), None)
    }

    /// Replace name, query and description of an existing segment.
    pub fn update(&self, id: i64, input: &SegmentInput) -> Result<Segment, ServiceError> {
        if id < 1 {
            return Err(ServiceError::Validation(format!("invalid segment id: {id}")));
        }
        input.validate(self.config.name_max_len)?;

        let affected = self
            .db
            .exec(
                UPDATE_SEGMENT,
                &[
                    Value::Integer(id),
                    Value::Text(input.name.trim().to_string()),
                    Value::Text(input.segment_query.clone()),
                    Value::from(input.description.clone()),
                ],
            )
            .map_err(|e| storage_err("updating", e))?;

        if affected == 0 {
            return Err(ServiceError::NotFound(format!("segment {id} not found")));
        }
        info!(segment_id = id, "segment updated");

        self.get(Some(id), None)
    }

    /// Delete segments in one statement. Absent ids are ignored.
    pub fn delete(&self, ids: &[i64]) -> Result<(), ServiceError> {
        let affected = self
            .db
            .exec(DELETE_SEGMENTS, &[Value::IntArray(ids.to_vec())])
            .map_err(|e| storage_err("deleting", e))?;

        info!(requested = ids.len(), deleted = affected, "segments deleted");
        Ok(())
    }

    pub fn delete_one(&self, id: i64) -> Result<(), ServiceError> {
        self.delete(&[id])
    }

    // -----------------------------------------------------------------------
    // Counting
    // -----------------------------------------------------------------------

    /// Count subscribers matching `filter` under the configured deadline.
    /// A blank filter counts every subscriber.
    pub fn count_by_filter(&self, filter: &str) -> Result<i64, ServiceError> {
        let deadline = self.config.count_timeout().map(|t| Instant::now() + t);
        self.count_by_filter_until(filter, deadline)
    }

    /// Count subscribers matching `filter`, interrupting at `deadline`.
    pub fn count_by_filter_until(
        &self,
        filter: &str,
        deadline: Option<Instant>,
    ) -> Result<i64, ServiceError> {
        guard::count_read_only(self.db.as_ref(), COUNT_SUBSCRIBERS_BY_QUERY, filter, deadline)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Classify a failure of one of the module's own statements.
fn storage_err(action: &str, e: SQLError) -> ServiceError {
    match e {
        SQLError::Constraint(msg) => {
            ServiceError::Conflict(format!("segment conflicts with an existing one: {msg}"))
        }
        other => {
            error!("error {action} segments: {other}");
            ServiceError::Storage(format!("error {action} segments"))
        }
    }
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn text(row: &Row, col: &str) -> Result<String, ServiceError> {
    row.get_str(col)
        .map(str::to_string)
        .ok_or_else(|| ServiceError::Internal(format!("segment row missing {col}")))
}

fn row_to_segment(row: &Row) -> Result<Segment, ServiceError> {
    Ok(Segment {
        id: row
            .get_i64("id")
            .ok_or_else(|| ServiceError::Internal("segment row missing id".into()))?,
        uuid: text(row, "uuid")?,
        name: text(row, "name")?,
        segment_query: text(row, "segment_query")?,
        description: row.get_str("description").map(str::to_string),
        created_at: text(row, "created_at")?,
        updated_at: text(row, "updated_at")?,
        total: row.get_i64("total"),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use audience_sql::SqliteStore;

    fn test_store() -> SegmentStore {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        SegmentStore::new(db, SegmentConfig::default()).unwrap()
    }

    fn seed_subscribers(store: &SegmentStore) {
        store
            .db
            .exec_batch(
                r#"INSERT INTO subscribers (uuid, email, name, attribs, status) VALUES
                   ('s1', 'a@example.com', 'Ann',  '{"ltv": 2500}', 'enabled'),
                   ('s2', 'b@example.com', 'Bo',   '{"ltv": 10}',   'enabled'),
                   ('s3', 'c@example.com', 'Cy',   '{"ltv": 4000}', 'blocklisted'),
                   ('s4', 'd@example.com', 'Dee',  '{}',            'enabled');"#,
            )
            .unwrap();
    }

    fn input(name: &str, query: &str) -> SegmentInput {
        SegmentInput {
            name: name.into(),
            segment_query: query.into(),
            description: None,
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = test_store();
        let created = store
            .create(&SegmentInput {
                name: "High value".into(),
                segment_query: "subscribers.attribs->>'ltv' > 1000".into(),
                description: Some("top spenders".into()),
            })
            .unwrap();

        assert!(created.id > 0);
        assert_eq!(created.uuid.len(), 36);
        assert_eq!(created.total, None);

        let by_id = store.get(Some(created.id), None).unwrap();
        assert_eq!(by_id, created);

        let by_uuid = store.get(None, Some(&created.uuid)).unwrap();
        assert_eq!(by_uuid, created);
    }

    #[test]
    fn create_rejects_bad_names_before_storage() {
        let store = test_store();
        assert!(matches!(
            store.create(&input("", "1=1")),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            store.create(&input(&"x".repeat(201), "1=1")),
            Err(ServiceError::Validation(_))
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn get_requires_exactly_one_key() {
        let store = test_store();
        let seg = store.create(&input("a", "")).unwrap();

        assert!(matches!(store.get(None, None), Err(ServiceError::Validation(_))));
        assert!(matches!(store.get(Some(0), Some("  ")), Err(ServiceError::Validation(_))));
        assert!(matches!(
            store.get(Some(seg.id), Some(&seg.uuid)),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(store.get(Some(999), None), Err(ServiceError::NotFound(_))));
        assert!(matches!(
            store.get(None, Some("00000000-0000-0000-0000-000000000000")),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn update_keeps_uuid_and_created_at() {
        let store = test_store();
        let seg = store.create(&input("High value", "1=1")).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let updated = store
            .update(
                seg.id,
                &SegmentInput {
                    name: "VIP".into(),
                    segment_query: "1=1".into(),
                    description: Some("renamed".into()),
                },
            )
            .unwrap();
        assert_eq!(updated.id, seg.id);
        assert_eq!(updated.uuid, seg.uuid);
        assert_eq!(updated.created_at, seg.created_at);
        assert_eq!(updated.name, "VIP");
        assert_eq!(updated.description.as_deref(), Some("renamed"));
        assert!(updated.updated_at > seg.updated_at);
    }

    #[test]
    fn update_missing_is_not_found() {
        let store = test_store();
        assert!(matches!(
            store.update(42, &input("x", "")),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            store.update(0, &input("x", "")),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            store.update(42, &input("", "")),
            Err(ServiceError::Validation(_))
        ));
    }

    #[test]
    fn delete_is_idempotent_and_bulk() {
        let store = test_store();
        let a = store.create(&input("a", "")).unwrap();
        let b = store.create(&input("b", "")).unwrap();
        let c = store.create(&input("c", "")).unwrap();

        store.delete(&[a.id, b.id, 12345]).unwrap();
        store.delete(&[a.id]).unwrap();
        store.delete(&[]).unwrap();

        let left: Vec<i64> = store.list().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(left, vec![c.id]);

        store.delete_one(c.id).unwrap();
        store.delete_one(c.id).unwrap();
        assert!(matches!(store.get(Some(c.id), None), Err(ServiceError::NotFound(_))));
    }

    #[test]
    fn list_is_minimal_and_ordered_by_id() {
        let store = test_store();
        for name in ["zeta", "alpha", "mid"] {
            store.create(&input(name, "")).unwrap();
        }
        let all = store.list().unwrap();
        let names: Vec<&str> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert!(all.iter().all(|s| s.total.is_none()));
    }

    #[test]
    fn query_pages_and_reports_full_total() {
        let store = test_store();
        for i in 0..5 {
            store.create(&input(&format!("segment {i}"), "")).unwrap();
        }
        store.create(&input("other", "")).unwrap();

        let page = store.query("segment", "name", "asc", 2, 2).unwrap();
        assert_eq!(page.total, 5);
        let names: Vec<&str> = page.items.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["segment 2", "segment 3"]);
        assert!(page.items.iter().all(|s| s.total == Some(5)));

        let all = store.query("", "", "", 0, 0).unwrap();
        assert_eq!(all.total, 6);
        assert_eq!(all.items.len(), 6);
        // Default ordering is newest first; equal timestamps fall back to
        // the higher id first.
        assert!(all.items.windows(2).all(|w| {
            w[0].created_at > w[1].created_at
                || (w[0].created_at == w[1].created_at && w[0].id > w[1].id)
        }));

        let none = store.query("nothing matches", "name", "asc", 0, 20).unwrap();
        assert_eq!(none.total, 0);
        assert!(none.items.is_empty());
    }

    #[test]
    fn query_ties_follow_the_requested_direction() {
        let store = test_store();
        for name in ["a", "b", "c"] {
            store.create(&input(name, "")).unwrap();
        }
        store
            .db
            .exec("UPDATE segments SET created_at = '2024-01-01T00:00:00.000Z'", &[])
            .unwrap();

        let ids = |order: &str| -> Vec<i64> {
            store
                .query("", "created_at", order, 0, 0)
                .unwrap()
                .items
                .iter()
                .map(|s| s.id)
                .collect()
        };
        let desc = ids("desc");
        assert!(desc.windows(2).all(|w| w[0] > w[1]), "{desc:?}");
        let asc = ids("asc");
        assert!(asc.windows(2).all(|w| w[0] < w[1]), "{asc:?}");
    }

    #[test]
    fn query_search_is_literal_and_case_insensitive() {
        let store = test_store();
        store.create(&input("100% loyal", "")).unwrap();
        store.create(&input("1000 loyal", "")).unwrap();
        store.create(&input("High_Value", "")).unwrap();
        store.create(&input("HighXValue", "")).unwrap();

        let pct = store.query("100%", "", "", 0, 20).unwrap();
        assert_eq!(pct.total, 1);
        assert_eq!(pct.items[0].name, "100% loyal");

        let underscore = store.query("high_value", "", "", 0, 20).unwrap();
        assert_eq!(underscore.total, 1);
        assert_eq!(underscore.items[0].name, "High_Value");

        store.create(&input("Écoles du Nord", "")).unwrap();
        let accented = store.query("écoles", "", "", 0, 20).unwrap();
        assert_eq!(accented.total, 1);
        assert_eq!(accented.items[0].name, "Écoles du Nord");

        for evil in ["'; DELETE FROM segments; --", "' OR '1'='1", "\\"] {
            let res = store.query(evil, "name", "asc", 0, 20).unwrap();
            assert_eq!(res.total, 0, "{evil:?}");
        }
        assert_eq!(store.list().unwrap().len(), 5);
    }

    #[test]
    fn query_ignores_unknown_order_column() {
        let store = test_store();
        store.create(&input("b", "")).unwrap();
        store.create(&input("a", "")).unwrap();

        let res = store
            .query("", "name; DROP TABLE segments", "asc", 0, 20)
            .unwrap();
        let names: Vec<&str> = res.items.iter().map(|s| s.name.as_str()).collect();
        // Fell back to created_at ASC.
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn count_by_filter_empty_counts_everyone() {
        let store = test_store();
        seed_subscribers(&store);
        assert_eq!(store.count_by_filter("").unwrap(), 4);
        assert_eq!(store.count_by_filter("   ").unwrap(), 4);
        assert_eq!(
            store
                .count_by_filter("subscribers.attribs->>'ltv' > 1000")
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .count_by_filter("subscribers.status = 'enabled' AND subscribers.attribs->>'ltv' > 1000")
                .unwrap(),
            1
        );
    }

    #[test]
    fn count_by_filter_never_mutates() {
        let store = test_store();
        seed_subscribers(&store);

        for attack in [
            "1=1; UPDATE subscribers SET name = 'pwned' WHERE uuid = 's1'",
            "1=1; DELETE FROM subscribers",
            "1=1; DROP TABLE subscribers",
            "1=1); DELETE FROM subscribers; SELECT (1",
            "1=1;",
        ] {
            let err = store.count_by_filter(attack).unwrap_err();
            assert!(matches!(err, ServiceError::QuerySyntax(_)), "{attack:?} gave {err:?}");
        }

        let rows = store
            .db
            .query("SELECT name FROM subscribers WHERE uuid = 's1'", &[])
            .unwrap();
        assert_eq!(rows[0].get_str("name"), Some("Ann"));
        assert_eq!(store.count_by_filter("").unwrap(), 4);
    }

    #[test]
    fn count_by_filter_cannot_read_segments() {
        let store = test_store();
        seed_subscribers(&store);
        store.create(&input("secret", "")).unwrap();

        for attack in [
            "1=0 UNION ALL SELECT unicode((SELECT name FROM segments LIMIT 1)) ORDER BY 1 DESC",
            "1=0) GROUP BY (1) UNION ALL SELECT unicode(name) FROM segments WHERE (1=1",
        ] {
            let err = store.count_by_filter(attack).unwrap_err();
            assert!(matches!(err, ServiceError::QuerySyntax(_)), "{attack:?} gave {err:?}");
        }
    }

    #[test]
    fn count_by_filter_classifies_bad_input() {
        let store = test_store();
        seed_subscribers(&store);
        assert!(matches!(
            store.count_by_filter("subscribers.nope = 1"),
            Err(ServiceError::QuerySyntax(_))
        ));
        assert!(matches!(
            store.count_by_filter("status = = 'x'"),
            Err(ServiceError::QuerySyntax(_))
        ));
    }

    #[test]
    fn segment_lifecycle() {
        let store = test_store();

        let created = store
            .create(&SegmentInput {
                name: "High value".into(),
                segment_query: "subscribers.attribs->>'ltv' > '1000'".into(),
                description: Some("top spenders".into()),
            })
            .unwrap();
        assert!(created.id > 0);
        assert!(!created.uuid.is_empty());

        let listed = store.query("", "", "", 0, 20).unwrap();
        assert_eq!(listed.total, 1);
        assert_eq!(listed.items[0].id, created.id);
        assert_eq!(listed.items[0].total, Some(1));

        store
            .update(
                created.id,
                &SegmentInput {
                    name: "VIP".into(),
                    segment_query: created.segment_query.clone(),
                    description: created.description.clone(),
                },
            )
            .unwrap();
        let fetched = store.get(Some(created.id), None).unwrap();
        assert_eq!(fetched.name, "VIP");
        assert_eq!(fetched.uuid, created.uuid);

        store.delete(&[created.id]).unwrap();
        assert!(matches!(
            store.get(Some(created.id), None),
            Err(ServiceError::NotFound(_))
        ));
    }
}
