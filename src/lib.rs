pub mod api;
pub mod auth;
pub mod blob_names;
pub mod blob_store;
pub mod commit;
pub mod config;
pub mod database;
pub mod error;
pub mod image_file;
pub mod property;
pub mod property_filter;
pub mod property_repository;
pub mod reconciler;
pub mod record_deleter;
pub mod s3_ops;
pub mod s3_throttle;
pub mod staged_images;
pub mod transcoder;
pub mod upload_gateway;

#[cfg(test)]
pub(crate) mod testing;
