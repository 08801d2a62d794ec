//! Data model definitions for local draft snapshots.
//!
//! A [`Snapshot`] is the on-device copy of one editable document. It is keyed
//! by a [`DocumentKey`], which is namespaced per feature before it reaches a
//! storage backend (for example `weekly_plan_backup_2024-W03`).

use std::fmt::{Display, Formatter};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Version tag written into every snapshot.
///
/// Snapshots carrying any other version are treated as absent on load.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Key used for documents that have not been assigned a server id yet.
pub const PENDING_KEY: &str = "pending";

/// Stable identifier of one editable unit of draft data.
///
/// # Examples
///
/// ```rust
/// use draft_sync_core::snapshot_model::DocumentKey;
///
/// let week = DocumentKey::new("2024-W03");
/// assert_eq!(week.storage_key("weekly_plan"), "weekly_plan_backup_2024-W03");
///
/// let fresh = DocumentKey::pending();
/// assert!(fresh.is_pending());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentKey(id.into())
    }

    /// Key for a document created locally before the server assigned an id.
    pub fn pending() -> Self {
        DocumentKey(PENDING_KEY.to_string())
    }

    pub fn is_pending(&self) -> bool {
        self.0 == PENDING_KEY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespaced key under which the snapshot is written on device.
    pub fn storage_key(&self, feature: &str) -> String {
        format!("{feature}_backup_{}", self.0)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentKey {
    fn from(id: &str) -> Self {
        DocumentKey::new(id)
    }
}

impl From<String> for DocumentKey {
    fn from(id: String) -> Self {
        DocumentKey(id)
    }
}

/// Timestamped, versioned local copy of a document's data.
///
/// The store is the only writer of snapshots; everything else reads them.
///
/// ```rust
/// use draft_sync_core::snapshot_model::{Snapshot, SNAPSHOT_VERSION};
/// use serde_json::json;
///
/// let snapshot = Snapshot::new(json!({"focus": "ship the release"}));
/// assert_eq!(snapshot.version, SNAPSHOT_VERSION);
/// assert!(snapshot.taken_at().is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<D> {
    /// The draft itself, exactly as the form held it.
    pub data: D,

    /// RFC 3339 / ISO-8601 time at which the snapshot was taken.
    pub timestamp: String,

    /// Format tag, see [`SNAPSHOT_VERSION`].
    pub version: String,
}

impl<D> Snapshot<D> {
    /// Wrap `data` with the current UTC time and the current version tag.
    pub fn new(data: D) -> Self {
        Snapshot {
            data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            version: SNAPSHOT_VERSION.to_string(),
        }
    }

    /// Parsed timestamp, `None` if the stored string is not RFC 3339.
    pub fn taken_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn is_current_version(&self) -> bool {
        self.version == SNAPSHOT_VERSION
    }
}
