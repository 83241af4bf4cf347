//! Access-control and URL layer for CKAN files kept in an S3-compatible
//! object store: signed-URL resolution, the visibility cache, and propagation
//! of dataset privacy changes to object ACLs.

pub mod app;
pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use app::Filestore;
pub use config::FilestoreConfig;
