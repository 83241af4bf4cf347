//! Background visibility jobs.
//!
//! A dataset update that changes privacy enqueues one `VisibilityJob`; a worker
//! pops it and runs the propagation for the whole dataset. Jobs carry a TTL
//! after which an unstarted job is dropped, and failures are recorded for
//! `failure_ttl`. Nothing is retried.

use crate::{
    config::QueueSettings,
    errors::QueueError,
    models::AclState,
    services::propagator::VisibilityPropagator,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{sync::OnceCell, time::timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const KEY_PREFIX: &str = "s3filestore:";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VisibilityJob {
    pub id: Uuid,
    pub package_id: String,
    pub target: AclState,
    pub title: String,
    pub enqueued_at: DateTime<Utc>,
}

impl VisibilityJob {
    pub fn new(package_id: impl Into<String>, target: AclState) -> Self {
        let package_id = package_id.into();
        Self {
            id: Uuid::new_v4(),
            title: format!("s3filestore visibility update: {package_id} -> {target}"),
            package_id,
            target,
            enqueued_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(ttl)
            .map(|ttl| now - self.enqueued_at > ttl)
            .unwrap_or(false)
    }
}

/// Hand a job to the background queue. Returns once it is queued.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn enqueue(&self, job: VisibilityJob) -> Result<(), QueueError>;
}

/// Where a worker takes jobs from.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Next job, or `None` after waiting up to `wait` for one.
    async fn next_job(&self, wait: Duration) -> Result<Option<VisibilityJob>, QueueError>;

    async fn record_failure(&self, job: &VisibilityJob, reason: &str) -> Result<(), QueueError>;
}

/// Redis list queue: `LPUSH` to enqueue, `BRPOP` to consume. Each job also
/// gets a hash record expiring with the job TTL.
#[derive(Clone)]
pub struct RedisJobQueue {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
    settings: QueueSettings,
    command_timeout: Duration,
}

impl RedisJobQueue {
    pub fn new(url: &str, settings: QueueSettings, command_timeout: Duration) -> Result<Self, QueueError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: Arc::new(OnceCell::new()),
            settings,
            command_timeout,
        })
    }

    fn queue_key(&self) -> String {
        format!("{KEY_PREFIX}queue:{}", self.settings.name)
    }

    fn job_key(id: &Uuid) -> String {
        format!("{KEY_PREFIX}job:{id}")
    }

    fn failure_key(id: &Uuid) -> String {
        format!("{KEY_PREFIX}failed:{id}")
    }

    async fn connection(&self) -> Result<ConnectionManager, QueueError> {
        let client = self.client.clone();
        let conn = timeout(
            self.command_timeout,
            self.conn
                .get_or_try_init(|| async move { ConnectionManager::new(client).await }),
        )
        .await
        .map_err(|_| QueueError::Unavailable("timed out connecting to redis".into()))??;
        Ok(conn.clone())
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, QueueError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        timeout(self.command_timeout, op)
            .await
            .map_err(|_| QueueError::Unavailable("redis command timed out".into()))?
            .map_err(QueueError::from)
    }
}

#[async_trait]
impl JobDispatcher for RedisJobQueue {
    async fn enqueue(&self, job: VisibilityJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.connection().await?;
        let job_key = Self::job_key(&job.id);
        let ttl = self.settings.job_ttl.as_secs().max(1) as i64;

        self.bounded(conn.hset_multiple::<_, _, _, ()>(
            &job_key,
            &[("payload", payload.as_str()), ("status", "queued")],
        ))
        .await?;
        self.bounded(conn.expire::<_, ()>(&job_key, ttl)).await?;
        self.bounded(conn.lpush::<_, _, ()>(self.queue_key(), &payload))
            .await?;
        info!("enqueued job {} ({})", job.id, job.title);
        Ok(())
    }
}

#[async_trait]
impl JobSource for RedisJobQueue {
    async fn next_job(&self, wait: Duration) -> Result<Option<VisibilityJob>, QueueError> {
        let mut conn = self.connection().await?;
        // BRPOP blocks server-side, so the command timeout has to cover the wait.
        let popped = timeout(
            wait + self.command_timeout,
            conn.brpop::<_, Option<(String, String)>>(self.queue_key(), wait.as_secs_f64()),
        )
        .await
        .map_err(|_| QueueError::Unavailable("redis BRPOP timed out".into()))??;

        let Some((_, payload)) = popped else {
            return Ok(None);
        };
        let job: VisibilityJob = serde_json::from_str(&payload)?;
        self.bounded(conn.hset::<_, _, _, ()>(Self::job_key(&job.id), "status", "started"))
            .await?;
        Ok(Some(job))
    }

    async fn record_failure(&self, job: &VisibilityJob, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let ttl = self.settings.failure_ttl.as_secs().max(1);
        let record = serde_json::json!({ "job": job, "reason": reason, "failed_at": Utc::now() });
        self.bounded(conn.set_ex::<_, _, ()>(Self::failure_key(&job.id), record.to_string(), ttl))
            .await?;
        self.bounded(conn.hset::<_, _, _, ()>(Self::job_key(&job.id), "status", "failed"))
            .await
    }
}

/// Process-local queue. Jobs are lost when the process exits.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    jobs: Arc<Mutex<VecDeque<VisibilityJob>>>,
    failures: Arc<Mutex<Vec<(VisibilityJob, String)>>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<VisibilityJob> {
        self.jobs
            .lock()
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn failures(&self) -> Vec<(VisibilityJob, String)> {
        self.failures
            .lock()
            .map(|failures| failures.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobDispatcher for MemoryJobQueue {
    async fn enqueue(&self, job: VisibilityJob) -> Result<(), QueueError> {
        self.jobs
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".into()))?
            .push_back(job);
        Ok(())
    }
}

#[async_trait]
impl JobSource for MemoryJobQueue {
    async fn next_job(&self, wait: Duration) -> Result<Option<VisibilityJob>, QueueError> {
        let next = self
            .jobs
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".into()))?
            .pop_front();
        if next.is_none() {
            tokio::time::sleep(wait).await;
        }
        Ok(next)
    }

    async fn record_failure(&self, job: &VisibilityJob, reason: &str) -> Result<(), QueueError> {
        self.failures
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".into()))?
            .push((job.clone(), reason.to_string()));
        Ok(())
    }
}

/// Outcome of handling one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Expired,
    Failed(String),
}

pub struct JobWorker {
    source: Arc<dyn JobSource>,
    propagator: VisibilityPropagator,
    job_ttl: Duration,
    poll_interval: Duration,
}

impl JobWorker {
    pub fn new(source: Arc<dyn JobSource>, propagator: VisibilityPropagator, job_ttl: Duration) -> Self {
        Self {
            source,
            propagator,
            job_ttl,
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Process jobs until `shutdown` resolves.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("visibility worker started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("visibility worker stopping");
                    break;
                }
                next = self.source.next_job(self.poll_interval) => match next {
                    Ok(Some(job)) => {
                        self.handle(&job).await;
                    }
                    Ok(None) => debug!("no visibility jobs queued"),
                    Err(err) => {
                        warn!("job queue unavailable: {}", err);
                        tokio::time::sleep(self.poll_interval).await;
                    }
                },
            }
        }
    }

    pub async fn handle(&self, job: &VisibilityJob) -> JobOutcome {
        if job.is_expired(self.job_ttl, Utc::now()) {
            warn!("discarding expired job {} for package {}", job.id, job.package_id);
            return JobOutcome::Expired;
        }
        info!("starting job {}: package {} -> {}", job.id, job.package_id, job.target);
        let reason = match self
            .propagator
            .update_visibility(&job.package_id, Some(job.target))
            .await
        {
            Ok(report) => {
                info!(
                    "job {} done: {} examined, {} updated, {} failed, {} skipped",
                    job.id, report.examined, report.updated, report.failed, report.skipped
                );
                if report.is_clean() {
                    return JobOutcome::Completed;
                }
                format!("{} of {} objects could not be updated", report.failed, report.examined)
            }
            Err(err) => err.to_string(),
        };
        error!("job {} for package {} failed: {}", job.id, job.package_id, reason);
        if let Err(record_err) = self.source.record_failure(job, &reason).await {
            warn!("could not record failure of job {}: {}", job.id, record_err);
        }
        JobOutcome::Failed(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_expire_after_ttl() {
        let mut job = VisibilityJob::new("pkg-1", AclState::Private);
        let ttl = Duration::from_secs(60);
        assert!(!job.is_expired(ttl, Utc::now()));
        job.enqueued_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(job.is_expired(ttl, Utc::now()));
    }

    #[test]
    fn job_payload_round_trips_through_json() {
        let job = VisibilityJob::new("pkg-1", AclState::Public);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["target"], "public-read");
        assert_eq!(json["package_id"], "pkg-1");
        let back: VisibilityJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[tokio::test]
    async fn memory_queue_is_fifo() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(VisibilityJob::new("a", AclState::Public)).await.unwrap();
        queue.enqueue(VisibilityJob::new("b", AclState::Private)).await.unwrap();
        let first = queue.next_job(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.package_id, "a");
        assert_eq!(queue.pending().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_redis_fails_enqueue_quickly() {
        let queue = RedisJobQueue::new(
            "redis://127.0.0.1:1/",
            QueueSettings {
                name: "default".into(),
                job_ttl: Duration::from_secs(60),
                failure_ttl: Duration::from_secs(60),
            },
            Duration::from_millis(300),
        )
        .unwrap();
        let result = queue.enqueue(VisibilityJob::new("pkg-1", AclState::Private)).await;
        assert!(matches!(result, Err(QueueError::Unavailable(_))));
    }
}
