//! Signed-URL resolver.
//!
//! Turns an object key into a URL the browser can fetch: a plain URL when the
//! object is publicly readable, a presigned one otherwise. Results are cached,
//! and a cached URL is only reused while its form still matches the ACL.

use crate::{
    errors::StoreResult,
    models::{AclState, ObjectKey},
    services::{
        cache::VisibilityCache,
        object_store::{ObjectStore, acl_from_grants},
        url::{ObjectUrlBuilder, is_presigned_url, rewrite_for_proxy},
    },
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub signed_url_expiry: Duration,
    /// Lower-cased content types served without an attachment disposition.
    pub inline_content_types: Vec<String>,
    pub download_proxy: Option<String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            signed_url_expiry: Duration::from_secs(crate::config::DEFAULT_SIGNED_URL_EXPIRY_SECS),
            inline_content_types: vec!["application/pdf".into()],
            download_proxy: None,
        }
    }
}

#[derive(Clone)]
pub struct SignedUrlResolver {
    store: Arc<dyn ObjectStore>,
    cache: VisibilityCache,
    urls: ObjectUrlBuilder,
    settings: ResolverSettings,
}

impl SignedUrlResolver {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cache: VisibilityCache,
        urls: ObjectUrlBuilder,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            store,
            cache,
            urls,
            settings,
        }
    }

    pub fn cache(&self) -> &VisibilityCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// URL for `key`. A missing object is `StoreError::NotFound`; other store
    /// failures are returned as classified.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn resolve(&self, key: &ObjectKey) -> StoreResult<String> {
        let head = self.store.head_object(key).await?;
        let acl = self.acl_state(key).await?;

        if let Some(cached) = self.cache.url(key.as_str()).await {
            if is_presigned_url(&cached) != acl.is_public() {
                debug!("returning cached URL for {}", key);
                return Ok(cached);
            }
            debug!("cached URL for {} no longer matches ACL {}, discarding", key, acl);
            self.cache.invalidate_url(key.as_str()).await;
        }

        let url = match acl {
            AclState::Public => self.urls.public_url(key.as_str(), head.etag.as_deref()),
            AclState::Private => {
                let disposition = if self.is_inline(head.content_type.as_deref()) {
                    None
                } else {
                    Some(format!("attachment; filename={}", key.file_name()))
                };
                self.store
                    .presign_get(key, self.settings.signed_url_expiry, disposition)
                    .await?
            }
        };
        let url = match &self.settings.download_proxy {
            Some(proxy) => rewrite_for_proxy(&url, proxy),
            None => url,
        };

        self.cache.put_url(key.as_str(), &url).await;
        Ok(url)
    }

    /// ACL verdict for `key`, from cache or a live ACL read.
    pub async fn acl_state(&self, key: &ObjectKey) -> StoreResult<AclState> {
        if let Some(acl) = self.cache.acl(key.as_str()).await {
            return Ok(acl);
        }
        let grants = self.store.get_object_acl(key).await?;
        let acl = acl_from_grants(&grants);
        self.cache.put_acl(key.as_str(), acl).await;
        Ok(acl)
    }

    pub async fn is_public(&self, key: &ObjectKey) -> StoreResult<bool> {
        Ok(self.acl_state(key).await?.is_public())
    }

    /// Write `acl` to the store, drop the cached URL and cache the new verdict.
    pub async fn set_acl(&self, key: &ObjectKey, acl: AclState) -> StoreResult<()> {
        info!("setting ACL of {} to {}", key, acl);
        self.store.put_object_acl(key, acl).await?;
        self.cache.invalidate_url(key.as_str()).await;
        self.cache.put_acl(key.as_str(), acl).await;
        Ok(())
    }

    fn is_inline(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.settings
            .inline_content_types
            .iter()
            .any(|inline| *inline == essence)
    }
}
