//! src/services/memory_store.rs
//!
//! A process-local `ObjectStore` with S3 semantics for
//! the parts this crate relies on: md5 entity tags, canned ACLs, ListObjectsV2
//! pagination with opaque continuation tokens, and presigned URLs carrying an
//! `X-Amz-Signature` parameter. Used by the test suites and by dry runs.
//!
//! Every call is counted per operation and failures can be injected per
//! operation (optionally per key) to exercise error paths.

use crate::{
    errors::{StoreError, StoreResult},
    models::{AclState, ObjectKey, ObjectMetadata, ObjectPage, ObjectSummary},
    services::object_store::{AclGrant, ObjectStore, PutObjectRequest},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::debug;

const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    EnsureBucket,
    Put,
    Get,
    Head,
    Delete,
    GetAcl,
    PutAcl,
    List,
    Presign,
}

/// Failure kind to inject; mirrors the `StoreError` classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    AccessDenied,
    Transient,
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    content_type: Option<String>,
    etag: String,
    acl: AclState,
    last_modified: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    bucket_exists: bool,
    objects: BTreeMap<String, StoredObject>,
    calls: HashMap<StoreOp, usize>,
    acl_writes: HashMap<String, usize>,
    failures: Vec<(StoreOp, Option<String>, FailureKind)>,
}

#[derive(Clone)]
pub struct InMemoryObjectStore {
    bucket: String,
    /// Scheme and host used for presigned URLs.
    endpoint: String,
    virtual_hosts: bool,
    max_keys: usize,
    state: Arc<Mutex<State>>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            virtual_hosts: false,
            max_keys: DEFAULT_MAX_KEYS,
            state: Arc::new(Mutex::new(State {
                bucket_exists: true,
                ..State::default()
            })),
        }
    }

    /// Page size for `list_objects`, clamped to 1..=1000 like S3.
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys.clamp(1, DEFAULT_MAX_KEYS);
        self
    }

    /// Presign as `<scheme>://<bucket>.<host>/<key>` instead of path-style.
    pub fn with_virtual_hosts(mut self) -> Self {
        self.virtual_hosts = true;
        self
    }

    fn object_base(&self) -> String {
        match self.endpoint.split_once("://") {
            Some((scheme, host)) if self.virtual_hosts => format!("{}://{}.{}", scheme, self.bucket, host),
            _ if self.virtual_hosts => format!("{}.{}", self.bucket, self.endpoint),
            _ => format!("{}/{}", self.endpoint, self.bucket),
        }
    }

    /// Start without a bucket so `ensure_bucket` has something to create.
    pub fn without_bucket(self) -> Self {
        self.lock().bucket_exists = false;
        self
    }

    pub fn bucket_exists(&self) -> bool {
        self.lock().bucket_exists
    }

    /// Fail every call of `op` (restricted to `key` when given) until cleared.
    pub fn inject_failure(&self, op: StoreOp, key: Option<&str>, kind: FailureKind) {
        self.lock()
            .failures
            .push((op, key.map(str::to_string), kind));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of `put_object_acl` calls that targeted `key`.
    pub fn acl_writes(&self, key: &str) -> usize {
        self.lock().acl_writes.get(key).copied().unwrap_or(0)
    }

    /// ACL as stored, bypassing call accounting.
    pub fn stored_acl(&self, key: &str) -> Option<AclState> {
        self.lock().objects.get(key).map(|obj| obj.acl)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked mid-call;
        // the map itself is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the call and apply any injected failure.
    fn enter(&self, op: StoreOp, key: Option<&str>) -> StoreResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        let injected = state.failures.iter().find_map(|(fop, fkey, kind)| {
            let key_matches = match (fkey, key) {
                (None, _) => true,
                (Some(fk), Some(k)) => fk == k,
                (Some(_), None) => false,
            };
            (*fop == op && key_matches).then_some(*kind)
        });
        if let Some(kind) = injected {
            let target = key.unwrap_or(&self.bucket).to_string();
            return Err(match kind {
                FailureKind::NotFound => StoreError::not_found(target),
                FailureKind::AccessDenied => StoreError::access_denied(target, "injected"),
                FailureKind::Transient => StoreError::Transient(format!("injected timeout on {target}")),
            });
        }
        if op != StoreOp::EnsureBucket && !state.bucket_exists {
            return Err(StoreError::BucketNotFound(self.bucket.clone()));
        }
        Ok(state)
    }

    fn object<'a>(&self, state: &'a State, key: &ObjectKey) -> StoreResult<&'a StoredObject> {
        state
            .objects
            .get(key.as_str())
            .ok_or_else(|| StoreError::not_found(key.as_str()))
    }

    fn signature(&self, key: &ObjectKey, expires_in: Duration, issued: DateTime<Utc>) -> String {
        let digest = md5::compute(format!(
            "{}/{}/{}/{}",
            self.bucket,
            key,
            expires_in.as_secs(),
            issued.timestamp()
        ));
        format!("{:x}", digest)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> StoreResult<()> {
        let mut state = self.enter(StoreOp::EnsureBucket, None)?;
        if !state.bucket_exists {
            debug!("creating in-memory bucket {}", self.bucket);
            state.bucket_exists = true;
        }
        Ok(())
    }

    async fn put_object(&self, key: &ObjectKey, request: PutObjectRequest) -> StoreResult<String> {
        let mut state = self.enter(StoreOp::Put, Some(key.as_str()))?;
        let etag = format!("\"{:x}\"", md5::compute(&request.body));
        state.objects.insert(
            key.to_string(),
            StoredObject {
                body: request.body,
                content_type: request.content_type,
                etag: etag.clone(),
                acl: request.acl.unwrap_or(AclState::Private),
                last_modified: Utc::now(),
                metadata: request.metadata,
            },
        );
        Ok(etag)
    }

    async fn get_object(&self, key: &ObjectKey) -> StoreResult<Bytes> {
        let state = self.enter(StoreOp::Get, Some(key.as_str()))?;
        Ok(self.object(&state, key)?.body.clone())
    }

    async fn head_object(&self, key: &ObjectKey) -> StoreResult<ObjectMetadata> {
        let state = self.enter(StoreOp::Head, Some(key.as_str()))?;
        let obj = self.object(&state, key)?;
        Ok(ObjectMetadata {
            content_type: obj.content_type.clone(),
            content_length: obj.body.len() as i64,
            etag: Some(obj.etag.clone()),
            last_modified: Some(obj.last_modified),
            metadata: obj.metadata.clone(),
        })
    }

    async fn delete_object(&self, key: &ObjectKey) -> StoreResult<()> {
        // S3 deletes are idempotent: a missing key is not an error.
        let mut state = self.enter(StoreOp::Delete, Some(key.as_str()))?;
        if state.objects.remove(key.as_str()).is_none() {
            debug!("object {} already missing", key);
        }
        Ok(())
    }

    async fn get_object_acl(&self, key: &ObjectKey) -> StoreResult<Vec<AclGrant>> {
        let state = self.enter(StoreOp::GetAcl, Some(key.as_str()))?;
        let obj = self.object(&state, key)?;
        let mut grants = vec![AclGrant::owner_full_control("owner")];
        if obj.acl.is_public() {
            grants.push(AclGrant::all_users_read());
        }
        Ok(grants)
    }

    async fn put_object_acl(&self, key: &ObjectKey, acl: AclState) -> StoreResult<()> {
        let mut state = self.enter(StoreOp::PutAcl, Some(key.as_str()))?;
        match state.objects.get_mut(key.as_str()) {
            Some(obj) => obj.acl = acl,
            None => return Err(StoreError::not_found(key.as_str())),
        }
        *state.acl_writes.entry(key.to_string()).or_default() += 1;
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StoreResult<ObjectPage> {
        let state = self.enter(StoreOp::List, None)?;
        let start_after = continuation_token.as_deref().map(decode_continuation_token);
        let fetch_limit = self.max_keys + 1;

        let mut rows: Vec<ObjectSummary> = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| {
                start_after
                    .as_deref()
                    .is_none_or(|after| key.as_str() > after)
            })
            .take(fetch_limit)
            .map(|(key, obj)| ObjectSummary {
                key: key.clone(),
                size_bytes: obj.body.len() as i64,
                etag: Some(obj.etag.clone()),
                last_modified: Some(obj.last_modified),
            })
            .collect();

        let mut next_continuation_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            if let Some(last) = rows.last() {
                next_continuation_token = Some(encode_continuation_token(&last.key));
            }
        }

        Ok(ObjectPage {
            objects: rows,
            next_continuation_token,
        })
    }

    async fn presign_get(
        &self,
        key: &ObjectKey,
        expires_in: Duration,
        response_content_disposition: Option<String>,
    ) -> StoreResult<String> {
        let _state = self.enter(StoreOp::Presign, Some(key.as_str()))?;
        let issued = Utc::now();
        let mut url = format!(
            "{}/{}?X-Amz-Algorithm=AWS4-HMAC-SHA256&X-Amz-Date={}&X-Amz-Expires={}",
            self.object_base(),
            crate::services::url::encode_key(key.as_str()),
            issued.format("%Y%m%dT%H%M%SZ"),
            expires_in.as_secs()
        );
        if let Some(disposition) = response_content_disposition {
            url.push_str("&response-content-disposition=");
            url.push_str(&crate::services::url::encode_query_value(&disposition));
        }
        url.push_str("&X-Amz-Signature=");
        url.push_str(&self.signature(key, expires_in, issued));
        Ok(url)
    }
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD.encode(token)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> ObjectKey {
        ObjectKey::new(k).unwrap()
    }

    async fn put(store: &InMemoryObjectStore, k: &str, acl: AclState) {
        store
            .put_object(
                &key(k),
                PutObjectRequest {
                    body: Bytes::from_static(b"payload"),
                    acl: Some(acl),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn paginates_with_opaque_tokens() {
        let store = InMemoryObjectStore::new("bucket", "http://localhost:9000").with_max_keys(2);
        for name in ["a", "b", "c", "d", "e"] {
            put(&store, &format!("resources/r1/{name}.csv"), AclState::Private).await;
        }
        put(&store, "resources/r10/other.csv", AclState::Private).await;

        let first = store.list_objects("resources/r1/", None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        let token = first.next_continuation_token.clone().unwrap();
        assert!(!token.contains("resources/"), "token should be opaque");

        let all = store.list_prefix("resources/r1/").await.unwrap();
        let keys: Vec<_> = all.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            [
                "resources/r1/a.csv",
                "resources/r1/b.csv",
                "resources/r1/c.csv",
                "resources/r1/d.csv",
                "resources/r1/e.csv"
            ]
        );
        assert_eq!(store.call_count(StoreOp::List), 4);
    }

    #[tokio::test]
    async fn head_reports_md5_etag() {
        let store = InMemoryObjectStore::new("bucket", "http://localhost:9000");
        put(&store, "resources/r1/a.csv", AclState::Public).await;
        let meta = store.head_object(&key("resources/r1/a.csv")).await.unwrap();
        assert_eq!(
            meta.etag.as_deref(),
            Some(format!("\"{:x}\"", md5::compute(b"payload")).as_str())
        );
        assert_eq!(meta.content_length, 7);
    }

    #[tokio::test]
    async fn missing_bucket_is_created_once() {
        let store = InMemoryObjectStore::new("bucket", "http://localhost:9000").without_bucket();
        assert!(matches!(
            store.head_object(&key("x/y")).await,
            Err(StoreError::BucketNotFound(_))
        ));
        store.ensure_bucket().await.unwrap();
        store.ensure_bucket().await.unwrap();
        assert!(store.bucket_exists());
    }

    #[tokio::test]
    async fn injected_failures_are_scoped_to_key() {
        let store = InMemoryObjectStore::new("bucket", "http://localhost:9000");
        put(&store, "resources/r1/a.csv", AclState::Public).await;
        put(&store, "resources/r1/b.csv", AclState::Public).await;
        store.inject_failure(StoreOp::GetAcl, Some("resources/r1/a.csv"), FailureKind::Transient);

        assert!(store.get_object_acl(&key("resources/r1/a.csv")).await.unwrap_err().is_transient());
        assert!(store.get_object_acl(&key("resources/r1/b.csv")).await.is_ok());

        store.clear_failures();
        assert!(store.get_object_acl(&key("resources/r1/a.csv")).await.is_ok());
    }

    #[tokio::test]
    async fn presigned_urls_carry_a_signature() {
        let store = InMemoryObjectStore::new("bucket", "http://localhost:9000/");
        put(&store, "resources/r1/a b.csv", AclState::Private).await;
        let url = store
            .presign_get(
                &key("resources/r1/a b.csv"),
                Duration::from_secs(60),
                Some("attachment; filename=a b.csv".into()),
            )
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:9000/bucket/resources/r1/a%20b.csv?"));
        assert!(url.contains("X-Amz-Signature="));
        assert!(url.contains("X-Amz-Expires=60"));
    }
}
