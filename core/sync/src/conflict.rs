//! Conflict resolution for incoming remote updates.
//!
//! Every write carries a [`ChangeStamp`]. The context keeps, per object, the
//! stamp of the last write of each attribute ([`ObjectStamps`]); resolvers
//! compare an incoming update against those attribute by attribute, so two
//! replicas that have applied the same set of writes hold the same values
//! whatever order the writes arrived in.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use docsync_common::{Attributes, ChangeStamp, ClientId, SyncChange};

use crate::context::SynchronizedObject;

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The later write by change stamp wins.
    #[default]
    LastWriterWins,
    /// Keep a local write over a remote one; remote against remote is LWW.
    PreferLocal,
    /// Take a remote write over a local one; remote against remote is LWW.
    PreferRemote,
}

/// What to do with an incoming update to an existing object.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Merge the incoming attribute delta.
    ApplyIncoming,
    /// Leave the local object untouched.
    KeepLocal,
    /// Merge these attributes instead of the incoming delta.
    Merge(Attributes),
}

/// Stamps of the writes behind an object's local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStamps {
    /// Latest write of any kind, deletes included.
    pub latest: ChangeStamp,
    /// Insert that created the current incarnation of the object.
    pub created: ChangeStamp,
    /// Latest write of each attribute.
    pub attributes: BTreeMap<String, ChangeStamp>,
}

impl ObjectStamps {
    /// Stamps of an object created by `insert`.
    pub fn inserted(insert: &SyncChange) -> Self {
        let stamp = insert.stamp();
        Self {
            latest: stamp.clone(),
            created: stamp.clone(),
            attributes: insert
                .attributes
                .keys()
                .map(|name| (name.clone(), stamp.clone()))
                .collect(),
        }
    }

    /// Stamp of the last write of `name`, if it went through the sync pipeline.
    pub fn attribute(&self, name: &str) -> Option<&ChangeStamp> {
        self.attributes.get(name)
    }

    /// Whether every attribute `change` writes already holds a write at
    /// least as late, i.e. applying it again cannot change anything.
    pub fn covers(&self, change: &SyncChange) -> bool {
        let stamp = change.stamp();
        if change.attributes.is_empty() {
            return self.latest >= stamp;
        }
        change
            .attributes
            .keys()
            .all(|name| self.attribute(name).is_some_and(|written| *written >= stamp))
    }

    /// Note that `names` were written by `stamp`.
    pub fn record<'a>(&mut self, stamp: &ChangeStamp, names: impl IntoIterator<Item = &'a String>) {
        for name in names {
            match self.attributes.get_mut(name) {
                Some(current) if *current >= *stamp => {}
                Some(current) => *current = stamp.clone(),
                None => {
                    self.attributes.insert(name.clone(), stamp.clone());
                }
            }
        }
        self.observe(stamp);
    }

    /// Advance the latest write without touching attributes.
    pub fn observe(&mut self, stamp: &ChangeStamp) {
        if *stamp > self.latest {
            self.latest = stamp.clone();
        }
    }
}

/// Hook deciding how an incoming update meets the local object.
///
/// Consulted for updates, and for inserts of an object that already exists
/// locally. Records whose every attribute is already covered by a later
/// local write never reach the resolver.
pub trait ConflictResolver: Send + Sync {
    /// Decide the outcome.
    ///
    /// `stamps` is `None` if the object was never written through the sync
    /// pipeline.
    fn resolve(
        &self,
        local: &SynchronizedObject,
        incoming: &SyncChange,
        stamps: Option<&ObjectStamps>,
    ) -> Resolution;
}

/// Resolver implementing the built-in [`ConflictStrategy`] variants.
///
/// Decides attribute by attribute: an attribute the pipeline never wrote is
/// always taken.
pub struct StrategyResolver {
    strategy: ConflictStrategy,
    local_client: ClientId,
}

impl StrategyResolver {
    /// Create a resolver for the given strategy on behalf of `local_client`.
    pub fn new(strategy: ConflictStrategy, local_client: ClientId) -> Self {
        Self {
            strategy,
            local_client,
        }
    }

    /// Get the configured strategy.
    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    fn takes(&self, incoming: &ChangeStamp, written: Option<&ChangeStamp>) -> bool {
        let Some(written) = written else {
            return true;
        };
        if written == incoming {
            return false;
        }

        let written_locally = written.origin == self.local_client;
        match self.strategy {
            ConflictStrategy::PreferLocal if written_locally => false,
            ConflictStrategy::PreferRemote if written_locally => true,
            _ => incoming > written,
        }
    }
}

impl ConflictResolver for StrategyResolver {
    fn resolve(
        &self,
        _local: &SynchronizedObject,
        incoming: &SyncChange,
        stamps: Option<&ObjectStamps>,
    ) -> Resolution {
        let stamp = incoming.stamp();
        let accepted: Attributes = incoming
            .attributes
            .iter()
            .filter(|(name, _)| self.takes(&stamp, stamps.and_then(|s| s.attribute(name))))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        if accepted.is_empty() {
            Resolution::KeepLocal
        } else if accepted.len() == incoming.attributes.len() {
            Resolution::ApplyIncoming
        } else {
            Resolution::Merge(accepted)
        }
    }
}
