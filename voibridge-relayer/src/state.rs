//! Application state shared across all request handlers.

use std::sync::Arc;
use voibridge_core::store::DedupStore;

/// Cheap to clone; the store is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The dedup store the pipeline writes to.
    pub store: Arc<dyn DedupStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn DedupStore>) -> Self {
        Self { store }
    }
}
