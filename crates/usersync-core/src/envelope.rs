//! Versioned envelope wrapping opaque resource content.
//!
//! The wire format is JSON with exactly the keys `{version, content}` or
//! `{version, machineId, content}`. Anything else is not an envelope: an
//! unrecognized shape means the data was written by a newer client and must
//! be treated as incompatible rather than partially understood.

use serde::{Deserialize, Serialize};

/// The envelope stored remotely and in backups.
///
/// `content` is opaque UTF-8 owned by the resource strategy; the engine never
/// interprets it. `machine_id` tags the machine that produced the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncData {
    pub version: u32,
    #[serde(rename = "machineId", skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    pub content: String,
}

impl SyncData {
    pub fn new(version: u32, machine_id: Option<String>, content: impl Into<String>) -> Self {
        Self {
            version,
            machine_id,
            content: content.into(),
        }
    }

    /// Serialize to the wire JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("SyncData serialization should not fail")
    }

    /// Parse the wire JSON. Returns `None` for any shape other than the two
    /// recognized key sets.
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
