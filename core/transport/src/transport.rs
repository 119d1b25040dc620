//! Transport trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use docsync_common::{ApplicationId, ClientId, DocumentId, Result, SyncChange};

/// Layout version of the remote structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
}

impl FormatVersion {
    /// Current remote format version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Check if this version is compatible with the current version.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }

    /// Whether the remote was written by a newer, still compatible, build.
    pub fn is_newer_minor(&self) -> bool {
        self.is_compatible() && self.minor > Self::CURRENT.minor
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Marker stored at the sync fabric root.
///
/// Its presence is what "root exists" means; its contents are validated when
/// an application registers against an existing root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootMarker {
    /// Application the root belongs to.
    pub application: ApplicationId,
    /// Format version that created the root.
    pub format: FormatVersion,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl RootMarker {
    /// Marker for a root created now with the current format.
    pub fn new(application: ApplicationId) -> Self {
        Self {
            application,
            format: FormatVersion::CURRENT,
            created_at: Utc::now(),
        }
    }
}

/// Record of one client installation registered under a root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client: ClientId,
    /// Human-readable description (e.g. the machine name).
    pub description: String,
    pub registered_at: DateTime<Utc>,
}

/// Per-document structure description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub document: DocumentId,
    /// Human-readable description of the document.
    pub description: String,
    /// Opaque host-supplied metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Client that first registered the document.
    pub created_by: ClientId,
    pub created_at: DateTime<Utc>,
}

/// Structural contract every sync transport implements.
///
/// The registration operations and the change log only talk to the remote
/// through this trait; a new medium adds an implementation, never new
/// operation logic. Implementations must not retry internally: every error
/// is reported once to the caller.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Get the transport name (e.g., "file", "memory").
    fn name(&self) -> &str;

    /// Check if the fabric root structure exists.
    async fn root_exists(&self) -> Result<bool>;

    /// Create the fabric root structure.
    ///
    /// # Errors
    /// - Root already exists
    /// - Transport/I/O errors
    async fn create_root(&self, marker: &RootMarker) -> Result<()>;

    /// Read the marker of an existing root.
    ///
    /// # Errors
    /// - Root not found
    /// - Marker unreadable
    async fn read_root(&self) -> Result<RootMarker>;

    /// Remove the root structure and everything below it.
    ///
    /// Only used to compensate for a cancelled registration.
    async fn remove_root(&self) -> Result<()>;

    /// Record a client under the root. Re-registering a client overwrites
    /// its record.
    async fn register_client(&self, client: &ClientInfo) -> Result<()>;

    /// Check if the per-document structure exists.
    async fn document_exists(&self, document: &DocumentId) -> Result<bool>;

    /// Create the per-document structure.
    ///
    /// # Preconditions
    /// - Root must exist
    ///
    /// # Errors
    /// - Document already exists
    /// - Root not found
    async fn create_document(&self, info: &DocumentInfo) -> Result<()>;

    /// Read the description of an existing document.
    async fn read_document(&self, document: &DocumentId) -> Result<DocumentInfo>;

    /// Remove the per-document structure.
    ///
    /// Only used to compensate for a cancelled registration.
    async fn remove_document(&self, document: &DocumentId) -> Result<()>;

    /// Append a batch of change records to a document.
    ///
    /// # Preconditions
    /// - Document structure must exist
    /// - All records belong to `document` and share one origin
    ///
    /// # Postconditions
    /// - Either every record of the batch is visible to readers or none is
    ///
    /// # Errors
    /// - [`Error::AlreadyExists`](docsync_common::Error::AlreadyExists) if the
    ///   batch reuses a sequence number of its origin
    /// - [`Error::InvalidInput`](docsync_common::Error::InvalidInput) if the
    ///   batch does not start right after the origin's last record
    async fn append_changes(&self, document: &DocumentId, records: &[SyncChange]) -> Result<()>;

    /// Read the records of one origin with a sequence number greater than
    /// `since`, in ascending sequence order.
    async fn read_changes_since(
        &self,
        document: &DocumentId,
        origin: &ClientId,
        since: u64,
    ) -> Result<Vec<SyncChange>>;

    /// List the clients that have appended records to a document.
    async fn change_origins(&self, document: &DocumentId) -> Result<Vec<ClientId>>;
}

/// Check the shape of a batch before it is handed to a backend.
pub(crate) fn validate_batch(document: &DocumentId, records: &[SyncChange]) -> Result<()> {
    use docsync_common::Error;

    let Some(first) = records.first() else {
        return Err(Error::InvalidInput("Empty change batch".to_string()));
    };

    for (offset, record) in records.iter().enumerate() {
        if &record.document != document {
            return Err(Error::InvalidInput(format!(
                "Record {} belongs to document {}",
                record.id, record.document
            )));
        }
        if record.origin != first.origin {
            return Err(Error::InvalidInput(
                "A batch must come from a single origin".to_string(),
            ));
        }
        if record.sequence != first.sequence + offset as u64 {
            return Err(Error::InvalidInput(
                "Batch sequence numbers must be contiguous".to_string(),
            ));
        }
    }

    Ok(())
}

/// Check that a batch starting at `first` continues a stream whose last
/// record is `last` (0 for an empty stream).
pub(crate) fn check_continuation(origin: &ClientId, last: u64, first: u64) -> Result<()> {
    use docsync_common::Error;

    if first <= last {
        return Err(Error::AlreadyExists(format!(
            "Sequence {} already written for {} (last is {})",
            first, origin, last
        )));
    }
    if first != last + 1 {
        return Err(Error::InvalidInput(format!(
            "Batch for {} starts at {} but the stream ends at {}",
            origin, first, last
        )));
    }
    Ok(())
}
