//! Adapter between the host's object store and the change log.
//!
//! The host reports each save as a [`SaveSet`]. The context turns a save into
//! [`PendingChange`]s, hands them to the [`ChangeLog`] as one batch, and on
//! the way back applies remote [`SyncChange`]s to the store through the
//! conflict hook.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use docsync_common::{
    Attributes, ChangeKind, ChangeStamp, DocumentId, Error, ObjectId, PendingChange, Result,
    SyncChange,
};

use crate::conflict::{ConflictResolver, ObjectStamps, Resolution};
use crate::log::ChangeLog;

/// An object kept in sync: identity, entity name and attribute values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizedObject {
    pub id: ObjectId,
    pub entity: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl SynchronizedObject {
    pub fn new(id: ObjectId, entity: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id,
            entity: entity.into(),
            attributes,
        }
    }

    /// Set one attribute, builder style.
    pub fn with(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }
}

/// The host persistence engine as seen by the sync core.
pub trait ObjectStore: Send + Sync {
    /// Look up an object.
    fn get(&self, id: &ObjectId) -> Option<SynchronizedObject>;

    /// Insert a new object.
    ///
    /// # Errors
    /// - [`Error::AlreadyExists`] if the id is taken
    fn insert(&self, object: SynchronizedObject) -> Result<()>;

    /// Merge attribute values into an existing object.
    ///
    /// # Errors
    /// - [`Error::NotFound`] if the object does not exist
    fn update(&self, id: &ObjectId, attributes: &Attributes) -> Result<()>;

    /// Remove an object. Returns whether it was present.
    fn delete(&self, id: &ObjectId) -> Result<bool>;

    /// All objects, ordered by id.
    fn snapshot(&self) -> Vec<SynchronizedObject>;
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<ObjectId, SynchronizedObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, id: &ObjectId) -> Option<SynchronizedObject> {
        self.objects.read().get(id).cloned()
    }

    fn insert(&self, object: SynchronizedObject) -> Result<()> {
        let mut objects = self.objects.write();
        if objects.contains_key(&object.id) {
            return Err(Error::AlreadyExists(format!("Object already exists: {}", object.id)));
        }
        objects.insert(object.id.clone(), object);
        Ok(())
    }

    fn update(&self, id: &ObjectId, attributes: &Attributes) -> Result<()> {
        let mut objects = self.objects.write();
        let object = objects
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Object not found: {}", id)))?;
        for (name, value) in attributes {
            object.attributes.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.write().remove(id).is_some())
    }

    fn snapshot(&self) -> Vec<SynchronizedObject> {
        self.objects.read().values().cloned().collect()
    }
}

/// Objects touched by one save.
///
/// `inserted` carry their full attribute set, `updated` only the attributes
/// that changed, `deleted` only need id and entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveSet {
    #[serde(default)]
    pub inserted: Vec<SynchronizedObject>,
    #[serde(default)]
    pub updated: Vec<SynchronizedObject>,
    #[serde(default)]
    pub deleted: Vec<SynchronizedObject>,
}

impl SaveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, object: SynchronizedObject) -> Self {
        self.inserted.push(object);
        self
    }

    pub fn update(mut self, object: SynchronizedObject) -> Self {
        self.updated.push(object);
        self
    }

    pub fn delete(mut self, object: SynchronizedObject) -> Self {
        self.deleted.push(object);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of objects in the save.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// Result of applying one remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The store changed.
    Applied,
    /// Duplicate, superseded or targeting an absent object.
    Skipped,
}

/// Observes the host store for one document.
pub struct SynchronizedObjectContext {
    document: DocumentId,
    store: Arc<dyn ObjectStore>,
    resolver: Arc<dyn ConflictResolver>,
    /// Writes applied to each object, deletes included.
    stamps: Mutex<HashMap<ObjectId, ObjectStamps>>,
    /// Highest logical clock written or seen for the document.
    clock: AtomicU64,
    saves_tx: mpsc::UnboundedSender<SaveSet>,
    saves_rx: Mutex<Option<mpsc::UnboundedReceiver<SaveSet>>>,
}

impl SynchronizedObjectContext {
    pub fn new(
        document: DocumentId,
        store: Arc<dyn ObjectStore>,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        let (saves_tx, saves_rx) = mpsc::unbounded_channel();
        Self {
            document,
            store,
            resolver,
            stamps: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            saves_tx,
            saves_rx: Mutex::new(Some(saves_rx)),
        }
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Apply a save to the store, then report it.
    ///
    /// For hosts without a persistence engine of their own.
    pub fn save(&self, save: SaveSet) -> Result<()> {
        for object in &save.inserted {
            self.store.insert(object.clone())?;
        }
        for object in &save.updated {
            self.store.update(&object.id, &object.attributes)?;
        }
        for object in &save.deleted {
            self.store.delete(&object.id)?;
        }
        self.did_save(save)
    }

    /// Report a save the host has already committed to its store.
    ///
    /// Never blocks: the save is queued for the document's pipeline, which
    /// processes saves one at a time in arrival order.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] if the pipeline has shut down
    pub fn did_save(&self, save: SaveSet) -> Result<()> {
        if save.is_empty() {
            return Ok(());
        }
        trace!("Queueing save of {} object(s) for {}", save.len(), self.document);
        self.saves_tx
            .send(save)
            .map_err(|_| Error::InvalidState(format!("Save pipeline for {} is closed", self.document)))
    }

    /// Hand the save queue to the pipeline. Only the first call gets it.
    pub(crate) fn take_save_queue(&self) -> Option<mpsc::UnboundedReceiver<SaveSet>> {
        self.saves_rx.lock().take()
    }

    /// Convert a save into pending changes, one per object.
    ///
    /// Updates without changed attributes produce nothing.
    ///
    /// # Errors
    /// - [`Error::SaveProcessing`] if an object appears twice or lacks an
    ///   entity name
    pub fn changes_for_save(&self, save: &SaveSet) -> Result<Vec<PendingChange>> {
        let mut seen = HashSet::new();
        let mut changes = Vec::with_capacity(save.len());

        let tagged = save
            .inserted
            .iter()
            .map(|o| (ChangeKind::Insert, o))
            .chain(save.updated.iter().map(|o| (ChangeKind::Update, o)))
            .chain(save.deleted.iter().map(|o| (ChangeKind::Delete, o)));

        for (kind, object) in tagged {
            if !seen.insert(&object.id) {
                return Err(Error::SaveProcessing(format!(
                    "object {} appears more than once in one save",
                    object.id
                )));
            }
            if object.entity.is_empty() {
                return Err(Error::SaveProcessing(format!(
                    "object {} has no entity name",
                    object.id
                )));
            }

            let change = match kind {
                ChangeKind::Insert => PendingChange::insert(
                    object.id.clone(),
                    object.entity.clone(),
                    object.attributes.clone(),
                ),
                ChangeKind::Update if object.attributes.is_empty() => continue,
                ChangeKind::Update => PendingChange::update(
                    object.id.clone(),
                    object.entity.clone(),
                    object.attributes.clone(),
                ),
                ChangeKind::Delete => PendingChange::delete(object.id.clone(), object.entity.clone()),
            };
            changes.push(change);
        }

        Ok(changes)
    }

    /// Diff one save and append it to the log as a single batch.
    ///
    /// The records are clocked after every write this context has seen, so
    /// they win over any remote write they overwrite.
    ///
    /// # Errors
    /// - [`Error::SaveProcessing`] if diffing or appending fails; nothing of
    ///   the save is committed
    pub async fn process_save(&self, log: &ChangeLog, save: &SaveSet) -> Result<Vec<SyncChange>> {
        let changes = self.changes_for_save(save)?;
        let records = log.append_save(changes, self.observed_clock()).await?;
        self.record_local(&records);
        Ok(records)
    }

    /// Highest logical clock written or seen for this document.
    pub fn observed_clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Remember the stamps of records this client wrote.
    pub fn record_local(&self, records: &[SyncChange]) {
        let mut stamps = self.stamps.lock();
        for record in records {
            self.clock.fetch_max(record.clock, Ordering::SeqCst);
            match record.kind {
                ChangeKind::Insert => {
                    stamps.insert(record.object.clone(), ObjectStamps::inserted(record));
                }
                ChangeKind::Update => match stamps.get_mut(&record.object) {
                    Some(entry) => entry.record(&record.stamp(), record.attributes.keys()),
                    None => {
                        let mut entry = untracked(record);
                        entry.record(&record.stamp(), record.attributes.keys());
                        stamps.insert(record.object.clone(), entry);
                    }
                },
                ChangeKind::Delete => Self::tombstone(&mut stamps, record),
            }
        }
    }

    /// Stamp of the last write applied to an object.
    pub fn stamp_of(&self, id: &ObjectId) -> Option<ChangeStamp> {
        self.stamps.lock().get(id).map(|entry| entry.latest.clone())
    }

    /// Stamps of the writes behind an object's local state.
    pub fn stamps_of(&self, id: &ObjectId) -> Option<ObjectStamps> {
        self.stamps.lock().get(id).cloned()
    }

    /// Apply a remote record to the store.
    ///
    /// Writes are ordered by [`ChangeStamp`]; the outcome only depends on
    /// which records have been applied, not on their arrival order, as long
    /// as each object's insert arrives before its updates. Applying the same
    /// record twice leaves the store as applying it once.
    ///
    /// - Inserts of an absent object apply unless a later delete is recorded;
    ///   inserts of a present object merge like updates
    /// - Updates of absent objects are skipped; others go through the
    ///   conflict hook unless every attribute already holds a later write
    /// - Deletes apply unless the object was re-inserted after them
    ///
    /// # Errors
    /// - [`Error::InvalidInput`] if the record belongs to another document
    /// - Store errors
    pub fn apply_remote(&self, change: &SyncChange) -> Result<ApplyOutcome> {
        if change.document != self.document {
            return Err(Error::InvalidInput(format!(
                "record for {} applied to context of {}",
                change.document, self.document
            )));
        }
        self.clock.fetch_max(change.clock, Ordering::SeqCst);

        let incoming = change.stamp();
        let mut stamps = self.stamps.lock();
        let present = self.store.get(&change.object);

        let outcome = match (change.kind, present) {
            (ChangeKind::Insert, None) => {
                let superseded = stamps
                    .get(&change.object)
                    .is_some_and(|entry| entry.latest >= incoming);
                if superseded {
                    ApplyOutcome::Skipped
                } else {
                    self.store.insert(SynchronizedObject::new(
                        change.object.clone(),
                        change.entity.clone(),
                        change.attributes.clone(),
                    ))?;
                    let mut entry = ObjectStamps::inserted(change);
                    if let Some(previous) = stamps.get(&change.object) {
                        entry.observe(&previous.latest);
                    }
                    stamps.insert(change.object.clone(), entry);
                    ApplyOutcome::Applied
                }
            }
            (ChangeKind::Update, None) => ApplyOutcome::Skipped,
            (ChangeKind::Insert | ChangeKind::Update, Some(local)) => {
                let outcome = self.merge(&mut stamps, &local, change)?;
                if change.kind == ChangeKind::Insert {
                    if let Some(entry) = stamps.get_mut(&change.object) {
                        if incoming > entry.created {
                            entry.created = incoming.clone();
                        }
                    }
                }
                outcome
            }
            (ChangeKind::Delete, present) => {
                let reinserted = stamps
                    .get(&change.object)
                    .is_some_and(|entry| entry.created > incoming);
                if reinserted {
                    ApplyOutcome::Skipped
                } else {
                    let deleted = present.is_some() && self.store.delete(&change.object)?;
                    Self::tombstone(&mut stamps, change);
                    if deleted {
                        ApplyOutcome::Applied
                    } else {
                        ApplyOutcome::Skipped
                    }
                }
            }
        };

        debug!(
            "{:?} {:?} of {} from {}#{} (clock {})",
            outcome, change.kind, change.object, change.origin, change.sequence, change.clock
        );
        Ok(outcome)
    }

    /// Run an update (or an insert of a present object) through the resolver.
    fn merge(
        &self,
        stamps: &mut HashMap<ObjectId, ObjectStamps>,
        local: &SynchronizedObject,
        change: &SyncChange,
    ) -> Result<ApplyOutcome> {
        let incoming = change.stamp();
        if stamps.get(&change.object).is_some_and(|entry| entry.covers(change)) {
            return Ok(ApplyOutcome::Skipped);
        }

        let accepted = match self.resolver.resolve(local, change, stamps.get(&change.object)) {
            Resolution::ApplyIncoming => change.attributes.clone(),
            Resolution::Merge(attributes) => attributes,
            Resolution::KeepLocal => Attributes::new(),
        };

        let entry = stamps
            .entry(change.object.clone())
            .or_insert_with(|| untracked(change));
        entry.observe(&incoming);
        if accepted.is_empty() {
            return Ok(ApplyOutcome::Skipped);
        }

        self.store.update(&change.object, &accepted)?;
        entry.record(&incoming, accepted.keys());
        Ok(ApplyOutcome::Applied)
    }

    /// Record a delete: the object's attributes are gone, its latest write
    /// guards against older inserts.
    fn tombstone(stamps: &mut HashMap<ObjectId, ObjectStamps>, record: &SyncChange) {
        let stamp = record.stamp();
        match stamps.get_mut(&record.object) {
            Some(entry) => {
                entry.attributes.clear();
                entry.observe(&stamp);
            }
            None => {
                stamps.insert(record.object.clone(), untracked(record));
            }
        }
    }
}

/// Stamps for an object created outside the sync pipeline: no attribute
/// write is known and any insert may replace it.
fn untracked(record: &SyncChange) -> ObjectStamps {
    let origin = ChangeStamp {
        clock: 0,
        origin: record.origin.clone(),
        sequence: 0,
    };
    let mut entry = ObjectStamps::inserted(record);
    entry.attributes.clear();
    entry.created = origin;
    entry
}
