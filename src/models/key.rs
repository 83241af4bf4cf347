//! Object key naming.
//!
//! Resource uploads live under `<storage-path>/resources/<resource-id>/<filename>`,
//! general uploads under `<storage-path>/storage/uploads/<upload-to>/<filename>`.

use crate::errors::{StoreError, StoreResult};
use std::fmt;

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// A validated path identifying one object in the bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Rejects empty or oversized keys, absolute keys, `..` segments and
    /// control or backslash characters.
    pub fn new(key: impl Into<String>) -> StoreResult<Self> {
        let key = key.into();
        if key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StoreError::InvalidObjectKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment, used for `Content-Disposition` filenames.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Key layout rooted at the configured storage path.
#[derive(Debug, Clone, Default)]
pub struct StoragePaths {
    storage_path: String,
}

impl StoragePaths {
    pub fn new(storage_path: impl Into<String>) -> Self {
        let storage_path = storage_path.into();
        Self {
            storage_path: storage_path.trim_matches('/').to_string(),
        }
    }

    fn join(&self, parts: &[&str]) -> String {
        let mut out = String::new();
        if !self.storage_path.is_empty() {
            out.push_str(&self.storage_path);
        }
        for part in parts {
            let part = part.trim_matches('/');
            if part.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(part);
        }
        out
    }

    /// Listing prefix for every version stored for a resource. Ends with `/`
    /// so `abc` never matches objects of `abcd`.
    pub fn resource_prefix(&self, resource_id: &str) -> String {
        let mut prefix = self.join(&["resources", resource_id]);
        prefix.push('/');
        prefix
    }

    pub fn resource_key(&self, resource_id: &str, filename: &str) -> StoreResult<ObjectKey> {
        ObjectKey::new(self.join(&["resources", resource_id, filename]))
    }

    pub fn upload_prefix(&self, upload_to: &str) -> String {
        let mut prefix = self.join(&["storage", "uploads", upload_to]);
        prefix.push('/');
        prefix
    }

    pub fn upload_key(&self, upload_to: &str, filename: &str) -> StoreResult<ObjectKey> {
        ObjectKey::new(self.join(&["storage", "uploads", upload_to, filename]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsafe_keys() {
        for bad in ["", "/abs/key", "a/../b", "a\\b", "a\nb"] {
            assert!(ObjectKey::new(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(ObjectKey::new("x".repeat(1025)).is_err());
        assert!(ObjectKey::new("resources/r1/data.csv").is_ok());
    }

    #[test]
    fn builds_resource_and_upload_keys() {
        let paths = StoragePaths::new("my-path/");
        assert_eq!(
            paths.resource_key("r1", "data.csv").unwrap().as_str(),
            "my-path/resources/r1/data.csv"
        );
        assert_eq!(paths.resource_prefix("r1"), "my-path/resources/r1/");
        assert_eq!(
            paths.upload_key("group", "logo.png").unwrap().as_str(),
            "my-path/storage/uploads/group/logo.png"
        );
    }

    #[test]
    fn empty_storage_path_has_no_leading_slash() {
        let paths = StoragePaths::default();
        assert_eq!(
            paths.resource_key("pkg-1", "data.csv").unwrap().as_str(),
            "resources/pkg-1/data.csv"
        );
    }

    #[test]
    fn file_name_is_last_segment() {
        let key = ObjectKey::new("resources/r1/report.pdf").unwrap();
        assert_eq!(key.file_name(), "report.pdf");
    }
}
