//! Per-document position in the change streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use docsync_common::{ClientId, Result};

/// A document's local view of the change log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Last sequence number written by this client.
    pub last_written: u64,
    /// Last sequence number applied, per remote origin.
    #[serde(default)]
    pub applied: BTreeMap<ClientId, u64>,
    /// When remote changes were last pulled.
    #[serde(default)]
    pub last_pull: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last applied sequence number of `origin` (0 if never pulled).
    pub fn applied_for(&self, origin: &ClientId) -> u64 {
        self.applied.get(origin).copied().unwrap_or(0)
    }

    /// Record that `origin` has been applied up to `sequence`.
    ///
    /// Never moves backwards.
    pub fn mark_applied(&mut self, origin: &ClientId, sequence: u64) {
        let entry = self.applied.entry(origin.clone()).or_insert(0);
        *entry = (*entry).max(sequence);
    }

    /// Record the local stream's last written sequence number.
    pub fn mark_written(&mut self, sequence: u64) {
        self.last_written = self.last_written.max(sequence);
    }

    /// Record a completed pull.
    pub fn mark_pulled(&mut self) {
        self.last_pull = Some(Utc::now());
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
