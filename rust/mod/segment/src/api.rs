use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use audience_core::ServiceError;

use crate::model::{CountRequest, DeleteQuery, Segment, SegmentInput, SegmentListQuery, parse_id};
use crate::store::SegmentStore;

type StoreState = Arc<SegmentStore>;

pub fn router(store: Arc<SegmentStore>) -> Router {
    Router::new()
        .route(
            "/segments",
            get(list_segments).post(create_segment).delete(delete_segments),
        )
        .route("/segments/@count", post(count_subscribers))
        .route("/segments/uuid/{uuid}", get(get_segment_by_uuid))
        .route(
            "/segments/{id}",
            get(get_segment).put(update_segment).delete(delete_segment),
        )
        .with_state(store)
}

// ---------------------------------------------------------------------------
// GET /segments
// ---------------------------------------------------------------------------

async fn list_segments(
    State(store): State<StoreState>,
    Query(query): Query<SegmentListQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    // Minimal listing skips search, paging and totals.
    if query.minimal {
        let items = store.list()?;
        let total = items.len();
        return Ok(Json(serde_json::json!({
            "items": items,
            "total": total,
            "page": 1,
            "perPage": total,
            "query": "",
        })));
    }

    let search = query.query.trim();
    let pg = query.pagination();
    let result = store.query(search, &query.order_by, &query.order, pg.offset(), pg.limit())?;
    Ok(Json(serde_json::json!({
        "items": result.items,
        "total": result.total,
        "page": pg.page.max(1),
        "perPage": pg.per_page,
        "query": search,
    })))
}

// ---------------------------------------------------------------------------
// GET /segments/{id}, GET /segments/uuid/{uuid}
// ---------------------------------------------------------------------------

async fn get_segment(
    State(store): State<StoreState>,
    Path(id): Path<String>,
) -> Result<Json<Segment>, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(store.get(Some(id), None)?))
}

async fn get_segment_by_uuid(
    State(store): State<StoreState>,
    Path(uuid): Path<String>,
) -> Result<Json<Segment>, ServiceError> {
    Ok(Json(store.get(None, Some(&uuid))?))
}

// ---------------------------------------------------------------------------
// POST /segments
// ---------------------------------------------------------------------------

async fn create_segment(
    State(store): State<StoreState>,
    Json(input): Json<SegmentInput>,
) -> Result<Json<Segment>, ServiceError> {
    Ok(Json(store.create(&input)?))
}

// ---------------------------------------------------------------------------
// PUT /segments/{id}
// ---------------------------------------------------------------------------

async fn update_segment(
    State(store): State<StoreState>,
    Path(id): Path<String>,
    Json(input): Json<SegmentInput>,
) -> Result<Json<Segment>, ServiceError> {
    let id = parse_id(&id)?;
    Ok(Json(store.update(id, &input)?))
}

// ---------------------------------------------------------------------------
// DELETE /segments/{id}, DELETE /segments?ids=1,2
// ---------------------------------------------------------------------------

async fn delete_segment(
    State(store): State<StoreState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let id = parse_id(&id)?;
    store.delete_one(id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn delete_segments(
    State(store): State<StoreState>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let ids = query.parse_ids()?;
    if ids.is_empty() {
        return Err(ServiceError::Validation("no segment ids given".into()));
    }
    store.delete(&ids)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ---------------------------------------------------------------------------
// POST /segments/@count
// ---------------------------------------------------------------------------

async fn count_subscribers(
    State(store): State<StoreState>,
    Json(req): Json<CountRequest>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let total = store.count_by_filter(&req.segment_query)?;
    Ok(Json(serde_json::json!({ "total": total })))
}
