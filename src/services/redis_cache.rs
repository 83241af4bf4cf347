//! Redis cache backend.
//!
//! One lazily established `ConnectionManager`, a timeout on every command and
//! a failure breaker: after `breaker_failure_threshold` consecutive failures
//! the backend rejects calls for `breaker_open_duration` without touching the
//! network, so an outage costs one timeout per window rather than per request.

use crate::{errors::CacheError, services::cache::CacheBackend};
use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, OnceCell},
    time::timeout,
};
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub struct RedisPolicy {
    pub timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_open_duration: Duration,
}

impl Default for RedisPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(250),
            breaker_failure_threshold: 5,
            breaker_open_duration: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct BreakerState {
    failure_count: u32,
    open_until: Option<Instant>,
}

#[derive(Clone)]
pub struct RedisCache {
    client: redis::Client,
    policy: RedisPolicy,
    conn: Arc<OnceCell<ConnectionManager>>,
    breaker: Arc<Mutex<BreakerState>>,
}

impl RedisCache {
    pub fn new(url: &str, policy: RedisPolicy) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            policy,
            conn: Arc::new(OnceCell::new()),
            breaker: Arc::new(Mutex::new(BreakerState::default())),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let client = self.client.clone();
        let conn = self
            .conn
            .get_or_try_init(|| async move {
                debug!("connecting to redis cache");
                ConnectionManager::new(client)
                    .await
                    .map_err(|e| CacheError::Unavailable(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }

    async fn breaker_check(&self) -> Result<(), CacheError> {
        let breaker = self.breaker.lock().await;
        match breaker.open_until {
            Some(until) if Instant::now() < until => Err(CacheError::CircuitOpen),
            _ => Ok(()),
        }
    }

    async fn record(&self, ok: bool) {
        let mut breaker = self.breaker.lock().await;
        if ok {
            breaker.failure_count = 0;
            breaker.open_until = None;
            return;
        }
        breaker.failure_count += 1;
        if breaker.failure_count >= self.policy.breaker_failure_threshold {
            warn!(
                "redis cache failed {} times in a row, bypassing it for {:?}",
                breaker.failure_count, self.policy.breaker_open_duration
            );
            breaker.failure_count = 0;
            breaker.open_until = Some(Instant::now() + self.policy.breaker_open_duration);
        }
    }

    /// Run one command under the breaker and the command timeout.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        self.breaker_check().await?;
        let result = timeout(self.policy.timeout, async {
            let conn = self.connection().await?;
            op(conn)
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))
        })
        .await
        .unwrap_or_else(|_| Err(CacheError::Unavailable("redis timeout".into())));
        self.record(result.is_ok()).await;
        result
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let key = key.to_string();
        self.run(|mut conn| async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let key = key.to_string();
        let value = value.to_string();
        let seconds = ttl.as_secs().max(1);
        self.run(|mut conn| async move { conn.set_ex::<_, _, ()>(key, value, seconds).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let key = key.to_string();
        self.run(|mut conn| async move { conn.del::<_, ()>(key).await })
            .await
    }
}
