//! Services: the store client, the visibility cache, and the resolver,
//! propagator and uploader built on them.

pub mod cache;
pub mod catalog;
pub mod download;
pub mod jobs;
pub mod memory_store;
pub mod object_store;
pub mod propagator;
pub mod redis_cache;
pub mod resolver;
pub mod s3_store;
pub mod sync;
pub mod uploader;
pub mod url;

pub use cache::{CacheBackend, CacheTtls, MemoryCache, VisibilityCache};
pub use catalog::{CkanCatalog, DatasetCatalog};
pub use download::{DownloadService, DownloadTarget};
pub use jobs::{JobDispatcher, JobSource, JobWorker, MemoryJobQueue, RedisJobQueue, VisibilityJob};
pub use memory_store::InMemoryObjectStore;
pub use object_store::ObjectStore;
pub use propagator::{PropagationReport, VisibilityPropagator};
pub use redis_cache::{RedisCache, RedisPolicy};
pub use resolver::{ResolverSettings, SignedUrlResolver};
pub use s3_store::S3ObjectStore;
pub use sync::{PackageVisibilitySync, SyncOutcome};
pub use uploader::{FileUpload, ObjectUploader, UploadOutcome};
