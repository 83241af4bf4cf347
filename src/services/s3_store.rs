//! S3-backed `ObjectStore` on the AWS SDK.
//!
//! Works against AWS and S3-compatible services (MinIO, Ceph) through a
//! custom endpoint. Every SDK failure goes through `map_sdk_error`, which keeps
//! the 404 class apart from throttling, timeouts and dispatch failures.

use crate::{
    config::{CredentialMode, StoreSettings},
    errors::{StoreError, StoreResult},
    models::{AclState, ObjectKey, ObjectMetadata, ObjectPage, ObjectSummary},
    services::object_store::{AclGrant, ObjectStore, PutObjectRequest},
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    Client,
    config::{Credentials, Region, timeout::TimeoutConfig},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    presigning::PresigningConfig,
    primitives::{ByteStream, DateTime as SmithyDateTime},
    types::{BucketLocationConstraint, CreateBucketConfiguration, ObjectCannedAcl},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Region that must not be sent as a location constraint.
const DEFAULT_AWS_REGION: &str = "us-east-1";

pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    region: String,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    /// Build the SDK client from settings. No network traffic happens here.
    pub async fn connect(settings: &StoreSettings) -> StoreResult<Self> {
        let region = Region::new(settings.region.clone());
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(settings.connect_timeout)
            .operation_timeout(settings.operation_timeout)
            .build();

        let mut builder = match &settings.credentials {
            CredentialMode::Static {
                access_key_id,
                secret_access_key,
            } => aws_sdk_s3::config::Builder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(region)
                .credentials_provider(Credentials::new(
                    access_key_id,
                    secret_access_key,
                    None,
                    None,
                    "s3filestore-config",
                )),
            CredentialMode::Ambient => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        builder = builder
            .force_path_style(settings.path_style)
            .timeout_config(timeouts);

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
        })
    }
}

/// Classify a failed response by HTTP status and S3 error code.
pub fn classify_response(status: u16, code: Option<&str>, message: &str, target: &str) -> StoreError {
    match (status, code) {
        (_, Some("NoSuchBucket")) => StoreError::BucketNotFound(target.to_string()),
        (404, _) | (_, Some("NoSuchKey" | "NotFound")) => StoreError::not_found(target),
        (403, _) | (_, Some("AccessDenied")) => StoreError::access_denied(target, message),
        (429 | 500 | 502 | 503 | 504, _)
        | (_, Some("SlowDown" | "Throttling" | "ThrottlingException" | "RequestTimeout" | "InternalError")) => {
            StoreError::Transient(format!("{status} on {target}: {message}"))
        }
        _ => StoreError::Rejected {
            status,
            message: format!("{target}: {message}"),
        },
    }
}

fn map_sdk_error<E>(err: SdkError<E>, target: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let inner = service.err();
            classify_response(
                status,
                inner.code(),
                inner.message().unwrap_or("no message"),
                target,
            )
        }
        SdkError::ResponseError(response) => {
            let status = response.raw().status().as_u16();
            classify_response(status, None, &DisplayErrorContext(&err).to_string(), target)
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StoreError::Transient(format!("{target}: {}", DisplayErrorContext(&err)))
        }
        SdkError::ConstructionFailure(_) => StoreError::Config(DisplayErrorContext(&err).to_string()),
        _ => StoreError::Rejected {
            status: 0,
            message: format!("{target}: {}", DisplayErrorContext(&err)),
        },
    }
}

fn canned(acl: AclState) -> ObjectCannedAcl {
    match acl {
        AclState::Public => ObjectCannedAcl::PublicRead,
        AclState::Private => ObjectCannedAcl::Private,
    }
}

fn to_chrono(ts: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn ensure_bucket(&self) -> StoreResult<()> {
        let err = match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!("bucket {} reachable", self.bucket);
                return Ok(());
            }
            Err(err) => map_sdk_error(err, &self.bucket),
        };
        if !err.is_not_found() {
            return Err(err);
        }

        info!("bucket {} not found, creating it", self.bucket);
        let mut create = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_AWS_REGION {
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        create.send().await.map_err(|e| {
            let err = map_sdk_error(e, &self.bucket);
            warn!("could not create bucket {}: {}", self.bucket, err);
            err
        })?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(bytes = request.body.len()))]
    async fn put_object(&self, key: &ObjectKey, request: PutObjectRequest) -> StoreResult<String> {
        let metadata = (!request.metadata.is_empty()).then_some(request.metadata);
        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .body(ByteStream::from(request.body))
            .set_content_type(request.content_type)
            .set_content_disposition(request.content_disposition)
            .set_acl(request.acl.map(canned))
            .set_metadata(metadata)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key.as_str()))?;
        Ok(output.e_tag.unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn get_object(&self, key: &ObjectKey) -> StoreResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key.as_str()))?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(format!("reading body of {key}: {e}")))?;
        Ok(body.into_bytes())
    }

    #[instrument(skip(self))]
    async fn head_object(&self, key: &ObjectKey) -> StoreResult<ObjectMetadata> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key.as_str()))?;
        Ok(ObjectMetadata {
            content_type: output.content_type,
            content_length: output.content_length.unwrap_or_default(),
            etag: output.e_tag,
            last_modified: output.last_modified.as_ref().and_then(to_chrono),
            metadata: output.metadata.unwrap_or_default(),
        })
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, key: &ObjectKey) -> StoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key.as_str()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_object_acl(&self, key: &ObjectKey) -> StoreResult<Vec<AclGrant>> {
        let output = self
            .client
            .get_object_acl()
            .bucket(&self.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key.as_str()))?;
        Ok(output
            .grants
            .unwrap_or_default()
            .into_iter()
            .filter_map(|grant| {
                let permission = grant.permission().map(|p| p.as_str().to_string());
                grant.grantee.map(|grantee| AclGrant {
                    grantee_type: grantee.r#type().as_str().to_string(),
                    uri: grantee.uri,
                    permission,
                })
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn put_object_acl(&self, key: &ObjectKey, acl: AclState) -> StoreResult<()> {
        self.client
            .put_object_acl()
            .bucket(&self.bucket)
            .key(key.as_str())
            .acl(canned(acl))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, key.as_str()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StoreResult<ObjectPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, prefix))?;

        let next_continuation_token = if output.is_truncated.unwrap_or(false) {
            output.next_continuation_token
        } else {
            None
        };
        let objects = output
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|obj| {
                let last_modified = obj.last_modified.as_ref().and_then(to_chrono);
                obj.key.map(|key| ObjectSummary {
                    key,
                    size_bytes: obj.size.unwrap_or_default(),
                    etag: obj.e_tag,
                    last_modified,
                })
            })
            .collect();

        Ok(ObjectPage {
            objects,
            next_continuation_token,
        })
    }

    #[instrument(skip(self))]
    async fn presign_get(
        &self,
        key: &ObjectKey,
        expires_in: Duration,
        response_content_disposition: Option<String>,
    ) -> StoreResult<String> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StoreError::Config(format!("presign expiry {expires_in:?}: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .set_response_content_disposition(response_content_disposition)
            .presigned(presigning)
            .await
            .map_err(|e| map_sdk_error(e, key.as_str()))?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_class() {
        assert!(classify_response(404, None, "", "k").is_not_found());
        assert!(classify_response(400, Some("NoSuchKey"), "", "k").is_not_found());
        assert!(matches!(
            classify_response(404, Some("NoSuchBucket"), "", "bucket"),
            StoreError::BucketNotFound(_)
        ));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        for status in [429, 500, 502, 503, 504] {
            let err = classify_response(status, None, "busy", "k");
            assert!(err.is_transient(), "{status} should be transient");
            assert!(!err.is_not_found());
        }
        assert!(classify_response(400, Some("SlowDown"), "", "k").is_transient());
    }

    #[test]
    fn forbidden_is_access_denied() {
        assert!(matches!(
            classify_response(403, Some("AccessDenied"), "no", "k"),
            StoreError::AccessDenied { .. }
        ));
    }

    #[test]
    fn other_statuses_are_rejections() {
        assert!(matches!(
            classify_response(400, Some("InvalidArgument"), "bad", "k"),
            StoreError::Rejected { status: 400, .. }
        ));
    }

    #[tokio::test]
    async fn builds_client_for_custom_endpoint_without_network() {
        let settings = StoreSettings {
            bucket: "ckan".into(),
            region: "us-east-1".into(),
            credentials: CredentialMode::Static {
                access_key_id: "minio".into(),
                secret_access_key: "minio123".into(),
            },
            endpoint: Some("https://localhost:9000".into()),
            addressing_style: crate::config::AddressingStyle::Path,
            path_style: true,
            connect_timeout: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(2),
        };
        let store = S3ObjectStore::connect(&settings).await.unwrap();
        assert_eq!(store.bucket(), "ckan");

        let url = store
            .presign_get(
                &ObjectKey::new("resources/r1/a.csv").unwrap(),
                Duration::from_secs(60),
                Some("attachment; filename=a.csv".into()),
            )
            .await
            .unwrap();
        assert!(url.starts_with("https://localhost:9000/ckan/resources/r1/a.csv?"));
        assert!(crate::services::url::is_presigned_url(&url));
    }

    #[tokio::test]
    async fn virtual_style_presigns_against_bucket_host() {
        let settings = StoreSettings {
            bucket: "ckan".into(),
            region: "us-east-1".into(),
            credentials: CredentialMode::Static {
                access_key_id: "minio".into(),
                secret_access_key: "minio123".into(),
            },
            endpoint: Some("https://storage.test:9000".into()),
            addressing_style: crate::config::AddressingStyle::Virtual,
            path_style: false,
            connect_timeout: Duration::from_secs(1),
            operation_timeout: Duration::from_secs(2),
        };
        let store = S3ObjectStore::connect(&settings).await.unwrap();

        let url = store
            .presign_get(
                &ObjectKey::new("resources/r1/a.csv").unwrap(),
                Duration::from_secs(60),
                None,
            )
            .await
            .unwrap();
        assert!(url.starts_with("https://ckan.storage.test:9000/resources/r1/a.csv?"), "{url}");
        assert!(url.contains("X-Amz-Signature="));

        let proxied = crate::services::url::rewrite_for_proxy(&url, "https://downloads.example/");
        assert!(proxied.starts_with("https://downloads.example/resources/r1/a.csv?"), "{proxied}");
        assert!(proxied.contains("X-Amz-Signature="));
    }
}
