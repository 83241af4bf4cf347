//! Dataset catalog client.
//!
//! The `auto` ACL policy needs each dataset's privacy flag. `DatasetCatalog` is
//! the injected seam; `CkanCatalog` reads it from the CKAN action API.

use crate::{errors::CatalogError, models::PackageInfo};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait DatasetCatalog: Send + Sync {
    async fn show_package(&self, package_id: &str) -> Result<PackageInfo, CatalogError>;

    async fn is_private(&self, package_id: &str) -> Result<bool, CatalogError> {
        Ok(self.show_package(package_id).await?.private)
    }
}

#[derive(Deserialize)]
struct ActionResponse {
    success: bool,
    #[serde(default)]
    result: Option<PackageInfo>,
    #[serde(default)]
    error: Option<ActionError>,
}

#[derive(Deserialize)]
struct ActionError {
    #[serde(rename = "__type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct CkanCatalog {
    client: Client,
    site_url: String,
    api_token: Option<String>,
}

impl CkanCatalog {
    pub fn new(site_url: impl Into<String>, api_token: Option<String>) -> Result<Self, CatalogError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            site_url: site_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl DatasetCatalog for CkanCatalog {
    async fn show_package(&self, package_id: &str) -> Result<PackageInfo, CatalogError> {
        debug!("fetching package {} from {}", package_id, self.site_url);
        let mut request = self
            .client
            .get(format!("{}/api/3/action/package_show", self.site_url))
            .query(&[("id", package_id)]);
        if let Some(token) = &self.api_token {
            request = request.header("Authorization", token.as_str());
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(CatalogError::PackageNotFound(package_id.to_string()));
        }

        let body: ActionResponse = response.json().await?;
        match (body.success, body.result) {
            (true, Some(package)) => Ok(package),
            (_, _) => {
                let error = body.error.unwrap_or(ActionError {
                    kind: None,
                    message: None,
                });
                if error.kind.as_deref() == Some("Not Found Error") {
                    return Err(CatalogError::PackageNotFound(package_id.to_string()));
                }
                Err(CatalogError::Api(format!(
                    "package_show {} failed ({}): {}",
                    package_id,
                    status,
                    error.message.unwrap_or_else(|| "no message".into())
                )))
            }
        }
    }
}
