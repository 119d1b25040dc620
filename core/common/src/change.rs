//! The `SyncChange` record: one immutable mutation in a document's log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::types::{ClientId, DocumentId, ObjectId};

/// Attribute name to value mapping carried by inserts and updates.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Kind of mutation a change record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Object created.
    Insert,
    /// Attributes of an existing object changed.
    Update,
    /// Object removed.
    Delete,
}

/// A change produced by a save, before the log assigns it a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub object: ObjectId,
    pub entity: String,
    pub kind: ChangeKind,
    pub attributes: Attributes,
}

impl PendingChange {
    /// Change inserting an object with its full attribute set.
    pub fn insert(object: ObjectId, entity: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            object,
            entity: entity.into(),
            kind: ChangeKind::Insert,
            attributes,
        }
    }

    /// Change updating the given attributes of an object.
    pub fn update(object: ObjectId, entity: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            object,
            entity: entity.into(),
            kind: ChangeKind::Update,
            attributes,
        }
    }

    /// Change deleting an object. Deletes never carry attributes.
    pub fn delete(object: ObjectId, entity: impl Into<String>) -> Self {
        Self {
            object,
            entity: entity.into(),
            kind: ChangeKind::Delete,
            attributes: Attributes::new(),
        }
    }
}

/// One immutable, ordered record in a document's synchronization log.
///
/// Records are only ever created by the change log when it assigns sequence
/// numbers; nothing mutates a record after it has been appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChange {
    /// Unique identifier of the record.
    pub id: Uuid,
    /// Document the record belongs to.
    pub document: DocumentId,
    /// Object the mutation targets.
    pub object: ObjectId,
    /// Entity (type) name of the object.
    pub entity: String,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// New attribute values; empty for deletes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    /// Position in the origin's stream for this document, starting at 1.
    pub sequence: u64,
    /// Logical clock of the write: greater than the clock of every record
    /// the origin had written or seen for this document when it wrote this one.
    pub clock: u64,
    /// Client that produced the record.
    pub origin: ClientId,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl SyncChange {
    /// Seal a pending change with its sequence number, clock and origin.
    pub fn from_pending(
        pending: PendingChange,
        document: DocumentId,
        sequence: u64,
        clock: u64,
        origin: ClientId,
        created_at: DateTime<Utc>,
    ) -> Self {
        let attributes = match pending.kind {
            ChangeKind::Delete => Attributes::new(),
            _ => pending.attributes,
        };

        Self {
            id: Uuid::new_v4(),
            document,
            object: pending.object,
            entity: pending.entity,
            kind: pending.kind,
            attributes,
            sequence,
            clock,
            origin,
            created_at,
        }
    }

    /// Ordering stamp of this record.
    pub fn stamp(&self) -> ChangeStamp {
        ChangeStamp {
            clock: self.clock,
            origin: self.origin.clone(),
            sequence: self.sequence,
        }
    }
}

/// Total order used to decide which of two writes to an object is the later one.
///
/// Compares by logical clock, then origin, then the origin's sequence number.
/// A write made after seeing another always has the greater clock; concurrent
/// writes are ordered by origin. Wall-clock time plays no part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeStamp {
    pub clock: u64,
    pub origin: ClientId,
    pub sequence: u64,
}

impl Ord for ChangeStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.origin.cmp(&other.origin))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for ChangeStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
