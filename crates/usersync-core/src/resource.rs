//! Resource tags, observable status, and conflicts.

use std::fmt::{self, Display, Formatter};

/// One category of synchronized user state.
///
/// The tag is fixed for the lifetime of an engine instance and names the
/// resource in manifests, persisted state paths, and backup handle URIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncResource {
    Settings,
    Keybindings,
    Snippets,
    Tasks,
    Extensions,
    GlobalState,
}

impl SyncResource {
    /// All resource kinds, in sync order.
    pub const ALL: [SyncResource; 6] = [
        SyncResource::Settings,
        SyncResource::Keybindings,
        SyncResource::Snippets,
        SyncResource::Tasks,
        SyncResource::Extensions,
        SyncResource::GlobalState,
    ];

    /// Stable lowercase key used in manifests, URIs, and directory names.
    pub fn key(&self) -> &'static str {
        match self {
            SyncResource::Settings => "settings",
            SyncResource::Keybindings => "keybindings",
            SyncResource::Snippets => "snippets",
            SyncResource::Tasks => "tasks",
            SyncResource::Extensions => "extensions",
            SyncResource::GlobalState => "globalState",
        }
    }

    /// PascalCase name used in persisted file names (`lastSyncSettings.json`).
    pub fn pascal_key(&self) -> &'static str {
        match self {
            SyncResource::Settings => "Settings",
            SyncResource::Keybindings => "Keybindings",
            SyncResource::Snippets => "Snippets",
            SyncResource::Tasks => "Tasks",
            SyncResource::Extensions => "Extensions",
            SyncResource::GlobalState => "GlobalState",
        }
    }

    /// Parse a manifest/URI key back into a resource tag.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.key() == key)
    }
}

impl Display for SyncResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

// Serialize as the stable key so manifests and events use one spelling.
impl serde::Serialize for SyncResource {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.key())
    }
}

impl<'de> serde::Deserialize<'de> for SyncResource {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let key = String::deserialize(d)?;
        SyncResource::from_key(&key)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown sync resource: {key}")))
    }
}

/// Observable status of one synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    /// Not syncing. Initial state.
    Idle,
    /// A sync cycle is in flight.
    Syncing,
    /// A preview produced conflicts awaiting resolution.
    HasConflicts,
}

/// A pending conflict between a local and a remote version of the resource.
///
/// Both sides are URIs into the preview scratch space so an external viewer
/// can render them side by side. Two conflicts are the same conflict iff both
/// URIs match.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Conflict {
    /// URI of the local version.
    pub local: String,
    /// URI of the incoming remote version.
    pub remote: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        for resource in SyncResource::ALL {
            assert_eq!(SyncResource::from_key(resource.key()), Some(resource));
        }
    }

    #[test]
    fn test_unknown_key() {
        assert_eq!(SyncResource::from_key("themes"), None);
        assert_eq!(SyncResource::from_key(""), None);
        // Keys are case sensitive
        assert_eq!(SyncResource::from_key("Settings"), None);
    }

    #[test]
    fn test_serde_uses_key() {
        let json = serde_json::to_string(&SyncResource::GlobalState).unwrap();
        assert_eq!(json, "\"globalState\"");
        let parsed: SyncResource = serde_json::from_str("\"keybindings\"").unwrap();
        assert_eq!(parsed, SyncResource::Keybindings);
    }

    #[test]
    fn test_conflict_equality() {
        let a = Conflict {
            local: "l".into(),
            remote: "r".into(),
        };
        let b = Conflict {
            local: "l".into(),
            remote: "r".into(),
        };
        let c = Conflict {
            local: "l".into(),
            remote: "other".into(),
        };
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
