//! URL shapes: public object URLs, download-proxy rewriting, and the
//! presigned-ness predicate the resolver uses to validate cached URLs.

use crate::errors::{StoreError, StoreResult};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use url::{Position, Url};

/// Unreserved characters plus `/`, as S3 encodes key paths.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_ENCODE_SET).to_string()
}

pub fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ENCODE_SET).to_string()
}

/// True when the query string carries a signature parameter
/// (`Signature=` for V2, `X-Amz-Signature=` for V4). Pure function of shape.
pub fn is_presigned_url(url: &str) -> bool {
    url.split_once('?')
        .is_some_and(|(_, query)| query.contains("Signature="))
}

/// Replace scheme and host of `url` with `proxy_base`, keeping path and query.
///
/// The signature still covers the original host, so the proxy has to forward
/// requests with the original `Host` header.
pub fn rewrite_for_proxy(url: &str, proxy_base: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => format!(
            "{}{}",
            proxy_base.trim_end_matches('/'),
            &parsed[Position::BeforePath..]
        ),
        Err(err) => {
            tracing::debug!("not rewriting unparseable URL {}: {}", url, err);
            url.to_string()
        }
    }
}

/// Builds unsigned object URLs for the configured endpoint and addressing style.
#[derive(Debug, Clone)]
pub struct ObjectUrlBuilder {
    endpoint: Option<Url>,
    bucket: String,
    region: String,
    path_style: bool,
}

impl ObjectUrlBuilder {
    pub fn new(
        endpoint: Option<&str>,
        bucket: impl Into<String>,
        region: impl Into<String>,
        path_style: bool,
    ) -> StoreResult<Self> {
        let endpoint = endpoint
            .map(|raw| {
                Url::parse(raw)
                    .map_err(|err| StoreError::Config(format!("invalid endpoint `{raw}`: {err}")))
            })
            .transpose()?;
        if let Some(url) = &endpoint {
            if url.host_str().is_none() {
                return Err(StoreError::Config(format!("endpoint `{url}` has no host")));
            }
        }
        Ok(Self {
            endpoint,
            bucket: bucket.into(),
            region: region.into(),
            path_style,
        })
    }

    pub fn is_path_style(&self) -> bool {
        self.path_style
    }

    /// Plain URL for `key`, with an `ETag` query parameter for client-side
    /// cache busting when an entity tag is known.
    pub fn public_url(&self, key: &str, etag: Option<&str>) -> String {
        let key = encode_key(key);
        let mut url = match (&self.endpoint, self.path_style) {
            (Some(endpoint), true) => format!(
                "{}/{}/{}",
                endpoint.as_str().trim_end_matches('/'),
                self.bucket,
                key
            ),
            (Some(endpoint), false) => {
                let host = endpoint.host_str().unwrap_or_default();
                let port = endpoint.port().map(|p| format!(":{p}")).unwrap_or_default();
                format!(
                    "{}://{}.{}{}/{}",
                    endpoint.scheme(),
                    self.bucket,
                    host,
                    port,
                    key
                )
            }
            (None, true) => format!(
                "https://s3.{}.amazonaws.com/{}/{}",
                self.region, self.bucket, key
            ),
            (None, false) => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        };
        if let Some(etag) = etag {
            url.push_str("?ETag=");
            url.push_str(&encode_query_value(etag));
        }
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn presigned_predicate_matches_v2_and_v4() {
        assert!(is_presigned_url(
            "https://example.s3.amazonaws.com/resources/foo?AWSAccessKeyId=SomeKey&Expires=9999999999&Signature=hb7%2F%2B"
        ));
        assert!(is_presigned_url(
            "https://s3.eu-west-1.amazonaws.com/b/k?X-Amz-Expires=60&X-Amz-Signature=abc"
        ));
        assert!(!is_presigned_url("https://example.s3.amazonaws.com/resources/foo"));
        assert!(!is_presigned_url(
            "https://example.s3.amazonaws.com/resources/foo?ETag=%22abc%22"
        ));
    }

    #[test]
    fn path_style_custom_endpoint() {
        let urls =
            ObjectUrlBuilder::new(Some("http://minio:9000/"), "bucket", "us-east-1", true).unwrap();
        assert_eq!(
            urls.public_url("resources/r1/data file.csv", Some("\"abc\"")),
            "http://minio:9000/bucket/resources/r1/data%20file.csv?ETag=%22abc%22"
        );
    }

    #[test]
    fn virtual_style_custom_endpoint() {
        let urls =
            ObjectUrlBuilder::new(Some("https://storage.example:8443"), "bucket", "r", false)
                .unwrap();
        assert_eq!(
            urls.public_url("resources/r1/data.csv", None),
            "https://bucket.storage.example:8443/resources/r1/data.csv"
        );
    }

    #[test]
    fn aws_endpoints_for_both_styles() {
        let path = ObjectUrlBuilder::new(None, "bucket", "eu-west-1", true).unwrap();
        assert_eq!(
            path.public_url("k.csv", None),
            "https://s3.eu-west-1.amazonaws.com/bucket/k.csv"
        );
        let virt = ObjectUrlBuilder::new(None, "bucket", "eu-west-1", false).unwrap();
        assert_eq!(
            virt.public_url("k.csv", None),
            "https://bucket.s3.eu-west-1.amazonaws.com/k.csv"
        );
    }

    #[test]
    fn rejects_endpoint_without_host() {
        assert!(ObjectUrlBuilder::new(Some("not a url"), "b", "r", true).is_err());
    }

    #[test]
    fn proxy_rewrite_keeps_path_and_query() {
        let url = "https://bucket.s3.eu-west-1.amazonaws.com/resources/r1/a.csv?X-Amz-Signature=abc";
        assert_eq!(
            rewrite_for_proxy(url, "https://downloads.example/"),
            "https://downloads.example/resources/r1/a.csv?X-Amz-Signature=abc"
        );
    }

    proptest! {
        #[test]
        fn public_urls_never_look_presigned(key in "[a-z0-9/_. -]{1,40}", etag in "[a-f0-9]{32}") {
            let urls = ObjectUrlBuilder::new(None, "bucket", "us-east-1", true).unwrap();
            let etag = format!("\"{etag}\"");
            prop_assert!(!is_presigned_url(&urls.public_url(&key, Some(&etag))));
        }
    }
}
