use audience_core::{ListParams, ServiceError};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Segment: a named, persisted subscriber filter
// ---------------------------------------------------------------------------

/// A stored segment definition.
///
/// `id`, `uuid` and both timestamps are assigned by storage. `uuid` and
/// `created_at` never change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: i64,
    pub uuid: String,
    pub name: String,

    /// Boolean filter expression over `subscribers` columns.
    pub segment_query: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub created_at: String,
    pub updated_at: String,

    /// Size of the full matching set of the listing query that produced
    /// this row. Only set by [`SegmentStore::query`](crate::SegmentStore::query).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

// ---------------------------------------------------------------------------
// API request types
// ---------------------------------------------------------------------------

/// Body for `POST /segments` and `PUT /segments/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentInput {
    pub name: String,

    #[serde(default)]
    pub segment_query: String,

    #[serde(default)]
    pub description: Option<String>,
}

impl SegmentInput {
    /// Check the name against the configured length bound.
    pub fn validate(&self, name_max_len: usize) -> Result<(), ServiceError> {
        let len = self.name.trim().chars().count();
        if len < 1 || len > name_max_len {
            return Err(ServiceError::Validation(format!(
                "invalid segment name: must be 1 to {name_max_len} characters"
            )));
        }
        Ok(())
    }
}

/// Query parameters for `GET /segments`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentListQuery {
    /// Free-text search over segment names.
    #[serde(default)]
    pub query: String,

    #[serde(default)]
    pub order_by: String,

    #[serde(default)]
    pub order: String,

    /// Skip pagination and totals; return every segment.
    #[serde(default)]
    pub minimal: bool,

    #[serde(default = "default_page")]
    pub page: usize,

    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    ListParams::default().page
}

fn default_per_page() -> usize {
    ListParams::default().per_page
}

impl Default for SegmentListQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            order_by: String::new(),
            order: String::new(),
            minimal: false,
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

impl SegmentListQuery {
    pub fn pagination(&self) -> ListParams {
        ListParams {
            page: self.page,
            per_page: self.per_page,
        }
    }
}

/// Query parameters for `DELETE /segments`.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    /// Comma-separated segment ids.
    #[serde(default)]
    pub ids: String,
}

impl DeleteQuery {
    pub fn parse_ids(&self) -> Result<Vec<i64>, ServiceError> {
        self.ids
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_id)
            .collect()
    }
}

/// Body for `POST /segments/@count`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountRequest {
    #[serde(default)]
    pub segment_query: String,
}

/// Parse a positive segment id from path or query input.
pub fn parse_id(s: &str) -> Result<i64, ServiceError> {
    match s.trim().parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ServiceError::Validation(format!("invalid segment id: {s:?}"))),
    }
}
