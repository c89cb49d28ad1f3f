pub mod api;
pub mod config;
pub mod guard;
pub mod model;
pub mod schema;
pub mod search;
pub mod store;

use std::sync::Arc;

use audience_core::{Module, ServiceError};
use audience_sql::SQLStore;
use axum::Router;

pub use config::SegmentConfig;
pub use model::{Segment, SegmentInput};
pub use store::SegmentStore;

/// The Segment module: named subscriber filters and read-only counting.
pub struct SegmentModule {
    store: Arc<SegmentStore>,
}

impl SegmentModule {
    /// Create the segment module and initialise its storage.
    pub fn new(db: Arc<dyn SQLStore>, config: SegmentConfig) -> Result<Self, ServiceError> {
        let store = Arc::new(SegmentStore::new(db, config)?);
        Ok(Self { store })
    }
}

impl Module for SegmentModule {
    fn name(&self) -> &str {
        "segment"
    }

    fn routes(&self) -> Router {
        api::router(Arc::clone(&self.store))
    }
}
