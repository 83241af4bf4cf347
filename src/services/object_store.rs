//! Object store contract.
//!
//! A thin surface over an S3-compatible bucket. Implementations classify every
//! failure into `StoreError` so callers can tell a missing object from a denied
//! or a timed-out request.

use crate::{
    errors::StoreResult,
    models::{AclState, ObjectKey, ObjectMetadata, ObjectPage, ObjectSummary},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::HashMap, time::Duration};

/// URI suffix of the S3 "everyone" group.
pub const ALL_USERS_GROUP_SUFFIX: &str = "AllUsers";

/// One grant of an object ACL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclGrant {
    /// `Group`, `CanonicalUser` or `AmazonCustomerByEmail`.
    pub grantee_type: String,
    pub uri: Option<String>,
    pub permission: Option<String>,
}

impl AclGrant {
    pub fn all_users_read() -> Self {
        Self {
            grantee_type: "Group".into(),
            uri: Some("http://acs.amazonaws.com/groups/global/AllUsers".into()),
            permission: Some("READ".into()),
        }
    }

    pub fn owner_full_control(owner: &str) -> Self {
        Self {
            grantee_type: "CanonicalUser".into(),
            uri: None,
            permission: Some(format!("FULL_CONTROL:{owner}")),
        }
    }

    fn targets_all_users(&self) -> bool {
        self.grantee_type == "Group"
            && self
                .uri
                .as_deref()
                .is_some_and(|uri| uri.ends_with(ALL_USERS_GROUP_SUFFIX))
    }
}

/// An object is public iff any grant targets the all-users group.
pub fn acl_from_grants(grants: &[AclGrant]) -> AclState {
    if grants.iter().any(AclGrant::targets_all_users) {
        AclState::Public
    } else {
        AclState::Private
    }
}

/// Payload and headers for a PUT.
#[derive(Debug, Clone, Default)]
pub struct PutObjectRequest {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub acl: Option<AclState>,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket this store targets.
    fn bucket(&self) -> &str;

    /// Check the bucket exists, creating it when absent. Idempotent.
    async fn ensure_bucket(&self) -> StoreResult<()>;

    /// Upload an object, returning its entity tag.
    async fn put_object(&self, key: &ObjectKey, request: PutObjectRequest) -> StoreResult<String>;

    async fn get_object(&self, key: &ObjectKey) -> StoreResult<Bytes>;

    async fn head_object(&self, key: &ObjectKey) -> StoreResult<ObjectMetadata>;

    async fn delete_object(&self, key: &ObjectKey) -> StoreResult<()>;

    async fn get_object_acl(&self, key: &ObjectKey) -> StoreResult<Vec<AclGrant>>;

    async fn put_object_acl(&self, key: &ObjectKey, acl: AclState) -> StoreResult<()>;

    /// One page of keys under `prefix`.
    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StoreResult<ObjectPage>;

    /// Presigned GET URL valid for `expires_in`.
    async fn presign_get(
        &self,
        key: &ObjectKey,
        expires_in: Duration,
        response_content_disposition: Option<String>,
    ) -> StoreResult<String>;

    /// Every key under `prefix`, following continuation tokens.
    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut token = None;
        loop {
            let page = self.list_objects(prefix, token.take()).await?;
            objects.extend(page.objects);
            match page.next_continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }
}
