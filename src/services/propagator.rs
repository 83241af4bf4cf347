//! Visibility propagator.
//!
//! Brings every stored version of an entity in line with a target ACL: the
//! current object gets the target, older uploads get the non-current policy.
//! A marker entry short-circuits repeat runs while it lives.

use crate::{
    errors::{CatalogError, FilestoreResult, StoreResult},
    models::{AclPolicy, AclState, EntityObjects, ObjectKey, PackageInfo, ResourceInfo, StoragePaths},
    services::{catalog::DatasetCatalog, resolver::SignedUrlResolver},
};
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Datasets update their resources at most this many at a time.
pub const PACKAGE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropagationReport {
    /// Objects whose ACL was compared.
    pub examined: usize,
    /// Objects whose ACL was rewritten.
    pub updated: usize,
    /// Objects (or whole entities, when listing failed) that could not be reconciled.
    pub failed: usize,
    /// Entities skipped because their marker already matched.
    pub skipped: usize,
}

impl PropagationReport {
    fn short_circuited() -> Self {
        Self {
            skipped: 1,
            ..Self::default()
        }
    }

    fn absorb(&mut self, other: PropagationReport) {
        self.examined += other.examined;
        self.updated += other.updated;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Clone)]
pub struct VisibilityPropagator {
    resolver: SignedUrlResolver,
    paths: StoragePaths,
    non_current: AclPolicy,
    catalog: Option<Arc<dyn DatasetCatalog>>,
}

impl VisibilityPropagator {
    pub fn new(resolver: SignedUrlResolver, paths: StoragePaths, non_current: AclPolicy) -> Self {
        Self {
            resolver,
            paths,
            non_current,
            catalog: None,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn DatasetCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn resolver(&self) -> &SignedUrlResolver {
        &self.resolver
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub fn catalog(&self) -> Option<&Arc<dyn DatasetCatalog>> {
        self.catalog.as_ref()
    }

    /// Reconcile every stored version of `entity` with `target`.
    ///
    /// Listing failures are returned; per-key failures are logged and counted.
    #[instrument(skip(self), fields(entity = %entity.id, target = %target))]
    pub async fn propagate(&self, entity: &EntityObjects, target: AclState) -> StoreResult<PropagationReport> {
        let current_key = self.paths.resource_key(&entity.id, &entity.current_filename)?;
        let cache = self.resolver.cache();
        if cache.marker(current_key.as_str()).await == Some(target) {
            debug!("objects of {} already {} per marker", entity.id, target);
            return Ok(PropagationReport::short_circuited());
        }

        let non_current_target = self.non_current.non_current_target(target);
        let objects = self
            .resolver
            .store()
            .list_prefix(&self.paths.resource_prefix(&entity.id))
            .await?;

        let mut report = PropagationReport::default();
        for object in objects {
            report.examined += 1;
            let desired = if object.key == current_key.as_str() {
                target
            } else {
                non_current_target
            };
            match self.reconcile(&object.key, desired).await {
                Ok(true) => report.updated += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!("could not set ACL of {} to {}: {}", object.key, desired, err);
                    report.failed += 1;
                    cache.invalidate_object(&object.key).await;
                }
            }
        }

        if report.is_clean() {
            cache.put_marker(current_key.as_str(), target).await;
        } else {
            warn!(
                "{} of {} objects of {} failed, marker not set",
                report.failed, report.examined, entity.id
            );
        }
        Ok(report)
    }

    /// Returns whether the ACL had to be rewritten.
    async fn reconcile(&self, key: &str, desired: AclState) -> StoreResult<bool> {
        let key = ObjectKey::new(key)?;
        let actual = self.resolver.acl_state(&key).await?;
        if actual == desired {
            return Ok(false);
        }
        self.resolver.set_acl(&key, desired).await?;
        Ok(true)
    }

    /// Run `propagate` for every uploaded resource of `package`.
    pub async fn propagate_package(&self, package: &PackageInfo, target: AclState) -> PropagationReport {
        let entities: Vec<EntityObjects> = package
            .uploaded_resources()
            .filter_map(ResourceInfo::entity)
            .collect();
        info!(
            "updating {} uploaded resources of {} to {}",
            entities.len(),
            package.id,
            target
        );

        let outcomes: Vec<_> = stream::iter(entities)
            .map(|entity| async move {
                let outcome = self.propagate(&entity, target).await;
                (entity, outcome)
            })
            .buffer_unordered(PACKAGE_CONCURRENCY)
            .collect()
            .await;

        let mut total = PropagationReport::default();
        for (entity, outcome) in outcomes {
            match outcome {
                Ok(report) => total.absorb(report),
                Err(err) => {
                    error!("visibility update of resource {} failed: {}", entity.id, err);
                    total.failed += 1;
                }
            }
        }
        total
    }

    /// Load `package_id` from the catalog and propagate `target`, or the
    /// target its privacy flag implies when none is given.
    pub async fn update_visibility(
        &self,
        package_id: &str,
        target: Option<AclState>,
    ) -> FilestoreResult<PropagationReport> {
        let catalog = self.catalog.as_ref().ok_or(CatalogError::NotConfigured)?;
        let package = catalog.show_package(package_id).await?;
        let target = target.unwrap_or(AclState::for_dataset(package.private));
        let report = self.propagate_package(&package, target).await;
        if report.is_clean() && target == AclState::for_dataset(package.private) {
            self.resolver
                .cache()
                .put_dataset_private(&package.id, package.private)
                .await;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        cache::{CacheTtls, MemoryCache, VisibilityCache},
        memory_store::{FailureKind, InMemoryObjectStore, StoreOp},
        object_store::{ObjectStore, PutObjectRequest},
        resolver::ResolverSettings,
        url::ObjectUrlBuilder,
    };
    use bytes::Bytes;
    use std::time::Duration;

    fn propagator(store: &InMemoryObjectStore, non_current: AclPolicy) -> VisibilityPropagator {
        let ttls = CacheTtls::from_window(
            Duration::from_secs(1800),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        )
        .unwrap();
        let resolver = SignedUrlResolver::new(
            Arc::new(store.clone()),
            VisibilityCache::new(Arc::new(MemoryCache::new()), "t:", ttls),
            ObjectUrlBuilder::new(Some("http://minio:9000"), "bucket", "us-east-1", true).unwrap(),
            ResolverSettings::default(),
        );
        VisibilityPropagator::new(resolver, StoragePaths::new(""), non_current)
    }

    async fn put(store: &InMemoryObjectStore, key: &str, acl: AclState) {
        store
            .put_object(
                &ObjectKey::new(key).unwrap(),
                PutObjectRequest {
                    body: Bytes::from_static(b"x"),
                    acl: Some(acl),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn applies_current_and_non_current_targets() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        put(&store, "resources/r1/new.csv", AclState::Private).await;
        put(&store, "resources/r1/old.csv", AclState::Public).await;
        put(&store, "resources/r10/other.csv", AclState::Private).await;
        let propagator = propagator(&store, AclPolicy::Fixed(AclState::Private));

        let report = propagator
            .propagate(&EntityObjects::new("r1", "new.csv"), AclState::Public)
            .await
            .unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.updated, 2);
        assert_eq!(store.stored_acl("resources/r1/new.csv"), Some(AclState::Public));
        assert_eq!(store.stored_acl("resources/r1/old.csv"), Some(AclState::Private));
        assert_eq!(store.acl_writes("resources/r10/other.csv"), 0);
    }

    #[tokio::test]
    async fn auto_non_current_policy_follows_target() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        put(&store, "resources/r1/new.csv", AclState::Public).await;
        put(&store, "resources/r1/old.csv", AclState::Public).await;
        let propagator = propagator(&store, AclPolicy::Auto);

        propagator
            .propagate(&EntityObjects::new("r1", "new.csv"), AclState::Private)
            .await
            .unwrap();
        assert_eq!(store.stored_acl("resources/r1/old.csv"), Some(AclState::Private));
    }

    #[tokio::test]
    async fn second_run_is_short_circuited_by_marker() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        put(&store, "resources/r1/a.csv", AclState::Public).await;
        let propagator = propagator(&store, AclPolicy::Fixed(AclState::Private));
        let entity = EntityObjects::new("r1", "a.csv");

        propagator.propagate(&entity, AclState::Private).await.unwrap();
        let second = propagator.propagate(&entity, AclState::Private).await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(store.call_count(StoreOp::List), 1);
        assert_eq!(store.acl_writes("resources/r1/a.csv"), 1);
    }

    #[tokio::test]
    async fn failed_key_is_counted_and_blocks_marker() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        put(&store, "resources/r1/a.csv", AclState::Public).await;
        put(&store, "resources/r1/b.csv", AclState::Public).await;
        store.inject_failure(StoreOp::PutAcl, Some("resources/r1/b.csv"), FailureKind::Transient);
        let propagator = propagator(&store, AclPolicy::Auto);
        let entity = EntityObjects::new("r1", "a.csv");

        let report = propagator.propagate(&entity, AclState::Private).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(store.stored_acl("resources/r1/a.csv"), Some(AclState::Private));

        store.clear_failures();
        let retry = propagator.propagate(&entity, AclState::Private).await.unwrap();
        assert_eq!(retry.skipped, 0);
        assert_eq!(retry.updated, 1);
        assert_eq!(store.stored_acl("resources/r1/b.csv"), Some(AclState::Private));
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        store.inject_failure(StoreOp::List, None, FailureKind::Transient);
        let propagator = propagator(&store, AclPolicy::Auto);
        let err = propagator
            .propagate(&EntityObjects::new("r1", "a.csv"), AclState::Private)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn package_run_covers_uploaded_resources_only() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        put(&store, "resources/r1/a.csv", AclState::Public).await;
        put(&store, "resources/r2/b.csv", AclState::Public).await;
        let propagator = propagator(&store, AclPolicy::Auto);
        let package: PackageInfo = serde_json::from_value(serde_json::json!({
            "id": "pkg-1",
            "private": true,
            "resources": [
                {"id": "r1", "url": "http://ckan/dataset/pkg-1/resource/r1/download/a.csv", "url_type": "upload"},
                {"id": "r2", "url": "b.csv", "url_type": "upload"},
                {"id": "r3", "url": "https://elsewhere/c.csv"}
            ]
        }))
        .unwrap();

        let report = propagator.propagate_package(&package, AclState::Private).await;
        assert_eq!(report.examined, 2);
        assert_eq!(report.updated, 2);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn update_visibility_needs_a_catalog() {
        let store = InMemoryObjectStore::new("bucket", "http://minio:9000");
        let propagator = propagator(&store, AclPolicy::Auto);
        assert!(matches!(
            propagator.update_visibility("pkg-1", None).await,
            Err(crate::errors::FilestoreError::Catalog(CatalogError::NotConfigured))
        ));
    }
}
