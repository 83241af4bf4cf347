//! ACL state of a stored object and the policies that choose it.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub const PUBLIC_ACL: &str = "public-read";
pub const PRIVATE_ACL: &str = "private";

/// Read permission of a single object at the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclState {
    #[serde(rename = "public-read")]
    Public,
    #[serde(rename = "private")]
    Private,
}

impl AclState {
    pub fn as_str(self) -> &'static str {
        match self {
            AclState::Public => PUBLIC_ACL,
            AclState::Private => PRIVATE_ACL,
        }
    }

    pub fn is_public(self) -> bool {
        self == AclState::Public
    }

    /// Target ACL for a dataset with the given privacy flag.
    pub fn for_dataset(private: bool) -> Self {
        if private {
            AclState::Private
        } else {
            AclState::Public
        }
    }
}

impl fmt::Display for AclState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AclState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            PUBLIC_ACL | "public" => Ok(AclState::Public),
            PRIVATE_ACL => Ok(AclState::Private),
            other => Err(format!("unknown ACL `{other}` (expected public-read or private)")),
        }
    }
}

/// Configured ACL policy, for current or non-current objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclPolicy {
    Fixed(AclState),
    /// Current objects: follow the dataset's privacy flag.
    /// Non-current objects: follow the current target.
    Auto,
}

impl AclPolicy {
    pub fn is_auto(self) -> bool {
        self == AclPolicy::Auto
    }

    /// ACL the current object of a dataset with the given privacy flag should carry.
    pub fn current_target(self, dataset_private: bool) -> AclState {
        match self {
            AclPolicy::Fixed(acl) => acl,
            AclPolicy::Auto => AclState::for_dataset(dataset_private),
        }
    }

    /// ACL a non-current object should carry when the current target is `current`.
    pub fn non_current_target(self, current: AclState) -> AclState {
        match self {
            AclPolicy::Fixed(acl) => acl,
            AclPolicy::Auto => current,
        }
    }
}

impl fmt::Display for AclPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclPolicy::Fixed(acl) => acl.fmt(f),
            AclPolicy::Auto => f.write_str("auto"),
        }
    }
}

impl FromStr for AclPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            return Ok(AclPolicy::Auto);
        }
        s.parse::<AclState>()
            .map(AclPolicy::Fixed)
            .map_err(|_| format!("unknown ACL policy `{s}` (expected public-read, private or auto)"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policies() {
        assert_eq!("auto".parse::<AclPolicy>(), Ok(AclPolicy::Auto));
        assert_eq!(
            "public-read".parse::<AclPolicy>(),
            Ok(AclPolicy::Fixed(AclState::Public))
        );
        assert_eq!(
            "PRIVATE".parse::<AclPolicy>(),
            Ok(AclPolicy::Fixed(AclState::Private))
        );
        assert!("authenticated-read".parse::<AclPolicy>().is_err());
    }

    #[test]
    fn non_current_auto_inherits_current_target() {
        assert_eq!(
            AclPolicy::Auto.non_current_target(AclState::Public),
            AclState::Public
        );
        assert_eq!(
            AclPolicy::Fixed(AclState::Private).non_current_target(AclState::Public),
            AclState::Private
        );
    }

    #[test]
    fn auto_current_target_follows_privacy_flag() {
        assert_eq!(AclPolicy::Auto.current_target(true), AclState::Private);
        assert_eq!(AclPolicy::Auto.current_target(false), AclState::Public);
        assert_eq!(
            AclPolicy::Fixed(AclState::Public).current_target(true),
            AclState::Public
        );
    }

    #[test]
    fn serializes_with_wire_names() {
        let json = serde_json::to_string(&AclState::Public).unwrap();
        assert_eq!(json, "\"public-read\"");
        let back: AclState = serde_json::from_str("\"private\"").unwrap();
        assert_eq!(back, AclState::Private);
    }
}
