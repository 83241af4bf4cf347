//! Visibility cache.
//!
//! `CacheBackend` is the raw key-value contract. `VisibilityCache` sits in
//! front of one backend, owns the key namespaces and TTLs, and turns every
//! backend fault into a miss or a no-op with a logged warning.

use crate::{errors::CacheError, models::AclState};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_PREFIX: &str = "s3filestore:";
const VISIBILITY_SUFFIX: &str = "/visibility";
const MARKER_SUFFIX: &str = "/visibility/all";
const PRIVATE_FLAG_SUFFIX: &str = "/private";

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Process-local backend with per-entry expiry.
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|(_, exp)| *exp > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".into()))?;
        let live = entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone());
        if live.is_none() {
            entries.remove(key);
        }
        Ok(live)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".into()))?;
        entries.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".into()))?;
        entries.remove(key);
        Ok(())
    }
}

/// TTLs for each namespace.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtls {
    /// Resolved URLs. Always strictly shorter than the signed URL expiry.
    pub url: Duration,
    /// ACL verdicts and dataset privacy flags.
    pub acl: Duration,
    /// "All objects already at target" markers.
    pub marker: Duration,
}

impl CacheTtls {
    /// Derive TTLs from the cache window and the signed URL expiry.
    ///
    /// Returns `None` when caching is disabled (a zero window) or when the
    /// expiry leaves no whole second for a URL entry to live.
    pub fn from_window(window: Duration, signed_url_expiry: Duration, marker: Duration) -> Option<Self> {
        // Backends store TTLs in whole seconds.
        let ceiling = signed_url_expiry.saturating_sub(Duration::from_secs(1));
        if window.is_zero() || ceiling < Duration::from_secs(1) {
            return None;
        }
        let url = if window < signed_url_expiry {
            window
        } else {
            signed_url_expiry / 2
        };
        Some(Self {
            url: url.clamp(Duration::from_secs(1), ceiling),
            acl: window,
            marker: marker.min(window),
        })
    }
}

#[derive(Clone)]
pub struct VisibilityCache {
    backend: Option<Arc<dyn CacheBackend>>,
    prefix: String,
    ttls: CacheTtls,
}

impl VisibilityCache {
    pub fn new(backend: Arc<dyn CacheBackend>, prefix: impl Into<String>, ttls: CacheTtls) -> Self {
        Self {
            backend: Some(backend),
            prefix: prefix.into(),
            ttls,
        }
    }

    /// Every lookup misses and every write is dropped.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            prefix: DEFAULT_CACHE_PREFIX.to_string(),
            ttls: CacheTtls {
                url: Duration::ZERO,
                acl: Duration::ZERO,
                marker: Duration::ZERO,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn ttls(&self) -> CacheTtls {
        self.ttls
    }

    fn full_key(&self, key: &str, suffix: &str) -> String {
        format!("{}{}{}", self.prefix, key, suffix)
    }

    async fn get(&self, key: String) -> Option<String> {
        let backend = self.backend.as_ref()?;
        match backend.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!("cache read of {} failed, treating as miss: {}", key, err);
                None
            }
        }
    }

    async fn put(&self, key: String, value: &str, ttl: Duration) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if let Err(err) = backend.put(&key, value, ttl).await {
            warn!("cache write of {} failed, skipping: {}", key, err);
        }
    }

    async fn delete(&self, key: String) {
        let Some(backend) = self.backend.as_ref() else {
            return;
        };
        if let Err(err) = backend.delete(&key).await {
            warn!("cache delete of {} failed: {}", key, err);
        }
    }

    pub async fn url(&self, key: &str) -> Option<String> {
        self.get(self.full_key(key, "")).await
    }

    pub async fn put_url(&self, key: &str, url: &str) {
        self.put(self.full_key(key, ""), url, self.ttls.url).await
    }

    pub async fn invalidate_url(&self, key: &str) {
        self.delete(self.full_key(key, "")).await
    }

    pub async fn acl(&self, key: &str) -> Option<AclState> {
        let raw = self.get(self.full_key(key, VISIBILITY_SUFFIX)).await?;
        match raw.parse() {
            Ok(acl) => Some(acl),
            Err(err) => {
                debug!("ignoring unreadable ACL cache entry for {}: {}", key, err);
                None
            }
        }
    }

    pub async fn put_acl(&self, key: &str, acl: AclState) {
        self.put(self.full_key(key, VISIBILITY_SUFFIX), acl.as_str(), self.ttls.acl)
            .await
    }

    /// Drop both the URL entry and the ACL verdict of an object.
    pub async fn invalidate_object(&self, key: &str) {
        self.invalidate_url(key).await;
        self.delete(self.full_key(key, VISIBILITY_SUFFIX)).await;
    }

    pub async fn marker(&self, current_key: &str) -> Option<AclState> {
        let raw = self.get(self.full_key(current_key, MARKER_SUFFIX)).await?;
        raw.parse().ok()
    }

    pub async fn put_marker(&self, current_key: &str, acl: AclState) {
        self.put(self.full_key(current_key, MARKER_SUFFIX), acl.as_str(), self.ttls.marker)
            .await
    }

    pub async fn invalidate_marker(&self, current_key: &str) {
        self.delete(self.full_key(current_key, MARKER_SUFFIX)).await
    }

    /// Last privacy flag seen for a dataset.
    pub async fn dataset_private(&self, dataset_id: &str) -> Option<bool> {
        let raw = self.get(self.full_key(dataset_id, PRIVATE_FLAG_SUFFIX)).await?;
        raw.parse().ok()
    }

    pub async fn put_dataset_private(&self, dataset_id: &str, private: bool) {
        self.put(
            self.full_key(dataset_id, PRIVATE_FLAG_SUFFIX),
            if private { "true" } else { "false" },
            self.ttls.acl,
        )
        .await
    }

    pub async fn invalidate_dataset_private(&self, dataset_id: &str) {
        self.delete(self.full_key(dataset_id, PRIVATE_FLAG_SUFFIX)).await
    }
}
