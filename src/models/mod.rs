//! Core data models for the access-control layer.
//!
//! Keys, ACL states and policies, object metadata as reported by the store,
//! and the dataset/resource view returned by the catalog.

pub mod acl;
pub mod key;
pub mod object;
pub mod package;

pub use acl::{AclPolicy, AclState};
pub use key::{ObjectKey, StoragePaths};
pub use object::{ObjectMetadata, ObjectPage, ObjectSummary};
pub use package::{EntityObjects, PackageInfo, ResourceInfo};
