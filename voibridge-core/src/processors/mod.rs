pub mod executor;
pub mod ingestion;
pub mod log_source;
pub mod reconciler;
