//! Uploads and deletions.
//!
//! Every write keeps the visibility cache honest: an upload replaces the URL
//! entry and marker of its key and records the ACL it was written with; a
//! delete drops both entries.

use crate::{
    errors::{CatalogError, FilestoreResult, StoreResult},
    models::{AclPolicy, AclState, EntityObjects, ObjectKey, ObjectMetadata},
    services::{object_store::PutObjectRequest, propagator::VisibilityPropagator},
};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{error, info, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A file on its way into the store.
#[derive(Debug, Clone, Default)]
pub struct FileUpload {
    pub filename: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub key: ObjectKey,
    pub etag: String,
    pub acl: AclState,
}

#[derive(Clone)]
pub struct ObjectUploader {
    propagator: VisibilityPropagator,
    policy: AclPolicy,
    inline_content_types: Vec<String>,
}

impl ObjectUploader {
    pub fn new(propagator: VisibilityPropagator, policy: AclPolicy, inline_content_types: Vec<String>) -> Self {
        Self {
            propagator,
            policy,
            inline_content_types,
        }
    }

    /// ACL for a new upload to a resource of `package_id`.
    pub async fn target_acl(&self, package_id: Option<&str>) -> FilestoreResult<AclState> {
        match self.policy {
            AclPolicy::Fixed(acl) => Ok(acl),
            AclPolicy::Auto => {
                let catalog = self
                    .propagator
                    .catalog()
                    .ok_or(CatalogError::NotConfigured)?;
                let package_id = package_id.ok_or_else(|| {
                    CatalogError::Api("resource has no package id; cannot resolve auto ACL".into())
                })?;
                let private = catalog.is_private(package_id).await?;
                Ok(self.policy.current_target(private))
            }
        }
    }

    /// Store a new version of a resource file and reconcile the older ones.
    pub async fn upload_resource(
        &self,
        resource_id: &str,
        package_id: Option<&str>,
        upload: FileUpload,
    ) -> FilestoreResult<UploadOutcome> {
        let acl = self.target_acl(package_id).await?;
        let filename = upload.filename.clone();
        let key = self.propagator.paths().resource_key(resource_id, &filename)?;
        let outcome = self.upload_to_key(key, upload, acl).await?;

        if self.policy.is_auto() {
            let entity = EntityObjects::new(resource_id, filename);
            match self.propagator.propagate(&entity, acl).await {
                Ok(report) if !report.is_clean() => {
                    warn!("{} older objects of {} kept a stale ACL", report.failed, resource_id)
                }
                Ok(_) => {}
                Err(err) => error!("visibility update after upload of {} failed: {}", resource_id, err),
            }
        }
        Ok(outcome)
    }

    /// General (non-resource) uploads such as site logos are always public.
    pub async fn upload_general(&self, upload_to: &str, upload: FileUpload) -> StoreResult<UploadOutcome> {
        let key = self.propagator.paths().upload_key(upload_to, &upload.filename)?;
        self.upload_to_key(key, upload, AclState::Public).await
    }

    pub async fn upload_to_key(&self, key: ObjectKey, upload: FileUpload, acl: AclState) -> StoreResult<UploadOutcome> {
        let content_type = upload
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let content_disposition = (!self.is_inline(&content_type))
            .then(|| format!("attachment; filename={}", key.file_name()));
        let request = PutObjectRequest {
            body: upload.body,
            content_type: Some(content_type),
            content_disposition,
            acl: Some(acl),
            metadata: upload.metadata,
        };

        let resolver = self.propagator.resolver();
        let etag = resolver
            .store()
            .put_object(&key, request)
            .await
            .inspect_err(|err| error!("upload to {} failed: {}", key, err))?;
        info!("uploaded {} as {}", key, acl);

        let cache = resolver.cache();
        cache.invalidate_url(key.as_str()).await;
        cache.invalidate_marker(key.as_str()).await;
        cache.put_acl(key.as_str(), acl).await;
        Ok(UploadOutcome { key, etag, acl })
    }

    /// Delete the object and drop its cache entries.
    pub async fn clear_key(&self, key: &ObjectKey) -> StoreResult<()> {
        let resolver = self.propagator.resolver();
        resolver.store().delete_object(key).await?;
        info!("removed {} from the store", key);
        resolver.cache().invalidate_object(key.as_str()).await;
        Ok(())
    }

    /// Delete a resource file. A key that is already gone is not an error.
    pub async fn delete_resource_file(&self, resource_id: &str, filename: &str) -> StoreResult<()> {
        let key = self.propagator.paths().resource_key(resource_id, filename)?;
        match self.clear_key(&key).await {
            Err(err) if err.is_not_found() => {
                warn!("key {} not found in bucket for delete", key);
                self.propagator.resolver().cache().invalidate_object(key.as_str()).await;
                Ok(())
            }
            other => other,
        }
    }

    /// HEAD-derived metadata of a resource file.
    pub async fn metadata(&self, resource_id: &str, filename: &str) -> StoreResult<ObjectMetadata> {
        let key = self.propagator.paths().resource_key(resource_id, filename)?;
        self.propagator.resolver().store().head_object(&key).await
    }

    fn is_inline(&self, content_type: &str) -> bool {
        let essence = content_type.split(';').next().unwrap_or_default().trim();
        self.inline_content_types
            .iter()
            .any(|inline| inline.eq_ignore_ascii_case(essence))
    }
}
