//! Wiring: builds the service graph from a loaded configuration.

use crate::{
    config::FilestoreConfig,
    models::StoragePaths,
    services::{
        CacheTtls, CkanCatalog, DownloadService, MemoryCache, ObjectStore, ObjectUploader,
        PackageVisibilitySync, RedisCache, RedisJobQueue, RedisPolicy, ResolverSettings,
        S3ObjectStore, SignedUrlResolver, VisibilityCache, VisibilityPropagator,
        cache::CacheBackend, url::ObjectUrlBuilder,
    },
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Filestore {
    pub config: FilestoreConfig,
    pub store: Arc<dyn ObjectStore>,
    pub resolver: SignedUrlResolver,
    pub propagator: VisibilityPropagator,
    pub uploader: ObjectUploader,
    pub sync: PackageVisibilitySync,
    pub downloads: DownloadService,
    /// Present when a Redis URL is configured.
    pub queue: Option<RedisJobQueue>,
}

impl Filestore {
    /// Build against the configured S3 endpoint.
    pub async fn connect(config: FilestoreConfig) -> Result<Self> {
        let store = S3ObjectStore::connect(&config.store)
            .await
            .context("configuring S3 client")?;
        Self::assemble(config, Arc::new(store))
    }

    /// Build around any `ObjectStore`.
    pub fn assemble(config: FilestoreConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let cache = build_cache(&config)?;
        let urls = ObjectUrlBuilder::new(
            config.store.endpoint.as_deref(),
            config.store.bucket.clone(),
            config.store.region.clone(),
            config.store.path_style,
        )?;
        let resolver = SignedUrlResolver::new(
            store.clone(),
            cache,
            urls,
            ResolverSettings {
                signed_url_expiry: config.signed_url_expiry,
                inline_content_types: config.inline_content_types.clone(),
                download_proxy: config.download_proxy.clone(),
            },
        );

        let mut propagator = VisibilityPropagator::new(
            resolver.clone(),
            StoragePaths::new(config.storage_path.clone()),
            config.non_current_acl,
        );
        match &config.catalog {
            Some(catalog) => {
                let client = CkanCatalog::new(catalog.site_url.clone(), catalog.api_token.clone())?;
                propagator = propagator.with_catalog(Arc::new(client));
            }
            None if config.acl.is_auto() => {
                warn!("ACL policy is auto but no catalog is configured; uploads will fail")
            }
            None => {}
        }

        let queue = config
            .redis_url
            .as_deref()
            .map(|url| RedisJobQueue::new(url, config.queue.clone(), config.store.connect_timeout))
            .transpose()
            .context("configuring job queue")?;

        let mut sync = PackageVisibilitySync::new(propagator.clone(), config.acl, config.capabilities);
        if let Some(queue) = &queue {
            sync = sync.with_dispatcher(Arc::new(queue.clone()));
        }

        Ok(Self {
            uploader: ObjectUploader::new(
                propagator.clone(),
                config.acl,
                config.inline_content_types.clone(),
            ),
            downloads: DownloadService::new(propagator.clone(), config.capabilities),
            sync,
            propagator,
            resolver,
            store,
            queue,
            config,
        })
    }

    /// Check (and create if needed) the bucket, when enabled.
    pub async fn check_access(&self) -> Result<()> {
        if !self.config.check_access_on_startup {
            return Ok(());
        }
        self.store
            .ensure_bucket()
            .await
            .with_context(|| format!("checking access to bucket {}", self.store.bucket()))?;
        info!("bucket {} is accessible", self.store.bucket());
        Ok(())
    }
}

fn build_cache(config: &FilestoreConfig) -> Result<VisibilityCache> {
    let Some(ttls) = CacheTtls::from_window(config.cache_window, config.signed_url_expiry, config.marker_ttl) else {
        info!("URL cache disabled");
        return Ok(VisibilityCache::disabled());
    };
    let backend: Arc<dyn CacheBackend> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::new(url, RedisPolicy::default()).context("configuring redis cache")?),
        None => Arc::new(MemoryCache::new()),
    };
    Ok(VisibilityCache::new(backend, config.cache_prefix.clone(), ttls))
}
