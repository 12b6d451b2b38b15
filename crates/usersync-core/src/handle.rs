//! Backup handle URIs naming historical versions of a resource.
//!
//! A handle points at one stored version in either the remote or the local
//! backup store: `user-data-sync://remote-backup/settings/<ref>`. The ref is
//! recovered as the final path segment.

use crate::resource::SyncResource;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// URI scheme for backup handles.
pub const HANDLE_SCHEME: &str = "user-data-sync";

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("invalid handle scheme: expected {HANDLE_SCHEME}")]
    InvalidScheme,
    #[error("invalid handle authority: {0}")]
    InvalidAuthority(String),
    #[error("invalid handle path: expected /<resource>/<ref>")]
    InvalidPath,
    #[error("unknown resource in handle: {0}")]
    UnknownResource(String),
}

/// Which backup store a handle points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupAuthority {
    Remote,
    Local,
}

impl BackupAuthority {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupAuthority::Remote => "remote-backup",
            BackupAuthority::Local => "local-backup",
        }
    }

    fn parse(s: &str) -> Result<Self, HandleError> {
        match s {
            "remote-backup" => Ok(BackupAuthority::Remote),
            "local-backup" => Ok(BackupAuthority::Local),
            other => Err(HandleError::InvalidAuthority(other.to_string())),
        }
    }
}

/// A parsed backup handle URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncHandleUri {
    authority: BackupAuthority,
    resource: SyncResource,
    ref_: String,
}

impl SyncHandleUri {
    pub fn remote_backup(resource: SyncResource, ref_: impl Into<String>) -> Self {
        Self {
            authority: BackupAuthority::Remote,
            resource,
            ref_: ref_.into(),
        }
    }

    pub fn local_backup(resource: SyncResource, ref_: impl Into<String>) -> Self {
        Self {
            authority: BackupAuthority::Local,
            resource,
            ref_: ref_.into(),
        }
    }

    pub fn authority(&self) -> BackupAuthority {
        self.authority
    }

    pub fn resource(&self) -> SyncResource {
        self.resource
    }

    /// The server-side version token this handle names.
    pub fn ref_(&self) -> &str {
        &self.ref_
    }
}

impl Display for SyncHandleUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{HANDLE_SCHEME}://{}/{}/{}",
            self.authority.as_str(),
            self.resource.key(),
            self.ref_
        )
    }
}

impl FromStr for SyncHandleUri {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(HANDLE_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or(HandleError::InvalidScheme)?;

        let (authority, path) = rest.split_once('/').ok_or(HandleError::InvalidPath)?;
        let authority = BackupAuthority::parse(authority)?;

        // Path is exactly <resource>/<ref>; the ref is the final segment.
        let (resource_key, ref_) = path.split_once('/').ok_or(HandleError::InvalidPath)?;
        if ref_.is_empty() || ref_.contains('/') {
            return Err(HandleError::InvalidPath);
        }
        let resource = SyncResource::from_key(resource_key)
            .ok_or_else(|| HandleError::UnknownResource(resource_key.to_string()))?;

        Ok(Self {
            authority,
            resource,
            ref_: ref_.to_string(),
        })
    }
}

// Serialize as the URI string for logs, events, JSON.
impl serde::Serialize for SyncHandleUri {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for SyncHandleUri {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A handle plus the creation time of the version it names.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SyncResourceHandle {
    /// Creation time in milliseconds since Unix epoch.
    pub created: u64,
    pub uri: SyncHandleUri,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let uri = SyncHandleUri::remote_backup(SyncResource::Settings, "42");
        assert_eq!(uri.to_string(), "user-data-sync://remote-backup/settings/42");

        let uri = SyncHandleUri::local_backup(SyncResource::GlobalState, "abc-1");
        assert_eq!(
            uri.to_string(),
            "user-data-sync://local-backup/globalState/abc-1"
        );
    }

    #[test]
    fn test_parse() {
        let uri: SyncHandleUri = "user-data-sync://remote-backup/keybindings/17"
            .parse()
            .unwrap();
        assert_eq!(uri.authority(), BackupAuthority::Remote);
        assert_eq!(uri.resource(), SyncResource::Keybindings);
        assert_eq!(uri.ref_(), "17");
    }

    #[test]
    fn test_roundtrip() {
        let original = SyncHandleUri::local_backup(SyncResource::Snippets, "ref-9");
        let parsed: SyncHandleUri = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_reject_wrong_scheme() {
        assert!(matches!(
            "https://remote-backup/settings/1".parse::<SyncHandleUri>(),
            Err(HandleError::InvalidScheme)
        ));
    }

    #[test]
    fn test_reject_unknown_authority() {
        assert!(matches!(
            "user-data-sync://cloud/settings/1".parse::<SyncHandleUri>(),
            Err(HandleError::InvalidAuthority(_))
        ));
    }

    #[test]
    fn test_reject_bad_path() {
        // Missing ref segment
        assert!("user-data-sync://remote-backup/settings"
            .parse::<SyncHandleUri>()
            .is_err());
        // Empty ref
        assert!("user-data-sync://remote-backup/settings/"
            .parse::<SyncHandleUri>()
            .is_err());
        // Too many segments
        assert!("user-data-sync://remote-backup/settings/1/2"
            .parse::<SyncHandleUri>()
            .is_err());
    }

    #[test]
    fn test_reject_unknown_resource() {
        assert!(matches!(
            "user-data-sync://remote-backup/themes/1".parse::<SyncHandleUri>(),
            Err(HandleError::UnknownResource(_))
        ));
    }

    #[test]
    fn test_serde_roundtrip() {
        let uri = SyncHandleUri::remote_backup(SyncResource::Tasks, "5");
        let json = serde_json::to_string(&uri).unwrap();
        let parsed: SyncHandleUri = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, uri);
    }
}
