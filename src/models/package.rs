//! Dataset (package) and resource views, as returned by the catalog.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PackageInfo {
    pub id: String,

    #[serde(default)]
    pub private: bool,

    #[serde(default)]
    pub resources: Vec<ResourceInfo>,
}

impl PackageInfo {
    /// Resources whose file lives in the object store.
    pub fn uploaded_resources(&self) -> impl Iterator<Item = &ResourceInfo> {
        self.resources.iter().filter(|r| r.is_upload())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ResourceInfo {
    pub id: String,

    #[serde(default)]
    pub package_id: Option<String>,

    /// Download URL or bare filename of the latest upload.
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub url_type: Option<String>,
}

impl ResourceInfo {
    pub fn is_upload(&self) -> bool {
        self.url_type.as_deref() == Some("upload")
    }

    /// Filename of the latest recorded upload: the last segment of `url`,
    /// without query or fragment.
    pub fn current_filename(&self) -> Option<&str> {
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        path.rsplit('/').next().filter(|name| !name.is_empty())
    }

    pub fn entity(&self) -> Option<EntityObjects> {
        self.current_filename().map(|filename| EntityObjects {
            id: self.id.clone(),
            current_filename: filename.to_string(),
        })
    }
}

/// The unit of propagation: an entity id and the filename of its current object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EntityObjects {
    pub id: String,
    pub current_filename: String,
}

impl EntityObjects {
    pub fn new(id: impl Into<String>, current_filename: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            current_filename: current_filename.into(),
        }
    }
}
