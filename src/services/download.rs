//! Download boundary: resource file request to redirect target.

use crate::{
    config::HostCapabilities,
    errors::{StoreError, StoreResult},
    services::propagator::VisibilityPropagator,
};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// Send the client here.
    Redirect(String),
    /// Object missing from the store; the host may serve its local copy.
    FilesystemFallback,
}

#[derive(Clone)]
pub struct DownloadService {
    propagator: VisibilityPropagator,
    capabilities: HostCapabilities,
}

impl DownloadService {
    pub fn new(propagator: VisibilityPropagator, capabilities: HostCapabilities) -> Self {
        Self {
            propagator,
            capabilities,
        }
    }

    /// Resolve a resource file. A missing object becomes `FilesystemFallback`
    /// when the host allows it, `StoreError::NotFound` otherwise.
    pub async fn download(&self, resource_id: &str, filename: &str) -> StoreResult<DownloadTarget> {
        let key = self.propagator.paths().resource_key(resource_id, filename)?;
        match self.propagator.resolver().resolve(&key).await {
            Ok(url) => Ok(DownloadTarget::Redirect(url)),
            Err(err) if err.is_not_found() && self.capabilities.filesystem_fallback => {
                info!("{} missing from the store, falling back to the filesystem", key);
                Ok(DownloadTarget::FilesystemFallback)
            }
            Err(err) if err.is_not_found() => Err(StoreError::not_found(key.as_str())),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{AclPolicy, AclState, ObjectKey, StoragePaths},
        services::{
            cache::VisibilityCache,
            memory_store::{FailureKind, InMemoryObjectStore, StoreOp},
            object_store::{ObjectStore, PutObjectRequest},
            resolver::{ResolverSettings, SignedUrlResolver},
            url::ObjectUrlBuilder,
        },
    };
    use std::sync::Arc;

    fn service(store: &InMemoryObjectStore, filesystem_fallback: bool) -> DownloadService {
        let resolver = SignedUrlResolver::new(
            Arc::new(store.clone()),
            VisibilityCache::disabled(),
            ObjectUrlBuilder::new(Some("http://minio:9000"), "bucket", "us-east-1", true).unwrap(),
            ResolverSettings::default(),
        );
        let propagator = VisibilityPropagator::new(
            resolver,
            StoragePaths::new(""),
            AclPolicy::Fixed(AclState::Private),
        );
        DownloadService::new(
            propagator,
            HostCapabilities {
                filesystem_fallback,
                async_visibility_update: false,
            },
        )
    }

    #[tokio::test]
    async fn redirects_to_resolved_url() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        store
            .put_object(
                &ObjectKey::new("resources/r1/a.csv").unwrap(),
                PutObjectRequest {
                    acl: Some(AclState::Public),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let target = service(&store, false).download("r1", "a.csv").await.unwrap();
        assert!(matches!(target, DownloadTarget::Redirect(url) if url.starts_with("http://minio:9000/bucket/resources/r1/a.csv")));
    }

    #[tokio::test]
    async fn missing_objects_follow_fallback_capability() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        assert_eq!(
            service(&store, true).download("r1", "gone.csv").await.unwrap(),
            DownloadTarget::FilesystemFallback
        );
        assert!(service(&store, false)
            .download("r1", "gone.csv")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn outages_never_fall_back() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        store.inject_failure(StoreOp::Head, None, FailureKind::Transient);
        let err = service(&store, true).download("r1", "a.csv").await.unwrap_err();
        assert!(err.is_transient());
    }
}
