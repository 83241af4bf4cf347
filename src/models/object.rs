//! Object metadata as reported by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of a HEAD probe.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ObjectMetadata {
    /// Content type (MIME type), if the store recorded one.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub content_length: i64,

    /// Entity tag exactly as returned by the store (usually quoted).
    pub etag: Option<String>,

    pub last_modified: Option<DateTime<Utc>>,

    /// User metadata (`x-amz-meta-*`).
    pub metadata: HashMap<String, String>,
}

/// One entry of a listing page.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ObjectSummary {
    pub key: String,
    pub size_bytes: i64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a prefix listing.
#[derive(Debug, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectSummary>,
    pub next_continuation_token: Option<String>,
}
