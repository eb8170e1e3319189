pub mod blob_store;
pub mod opportunity_store;
