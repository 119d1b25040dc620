//! Sync configuration.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use docsync_common::{ClientId, Result};
use docsync_transport::{SyncTransport, TransportRegistry, TransportSettings};

use crate::conflict::ConflictStrategy;
use crate::scheduler::SyncMode;

/// Configuration shared by an application's managers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identifier of this installation; names its change streams.
    pub client: ClientId,
    /// Human-readable description of this installation.
    #[serde(default)]
    pub client_description: String,
    /// When remote changes are pulled.
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// How incoming updates meet local writes.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// Fabric to sync through.
    #[serde(default)]
    pub transport: TransportSettings,
}

impl SyncConfig {
    /// Configuration for the given client with default policies.
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            client_description: String::new(),
            sync_mode: SyncMode::Manual,
            conflict_strategy: ConflictStrategy::LastWriterWins,
            transport: TransportSettings::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.client_description = description.into();
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn with_transport(mut self, transport: TransportSettings) -> Self {
        self.transport = transport;
        self
    }

    /// Open the configured fabric.
    ///
    /// # Errors
    /// - Whatever the registry reports for the settings
    pub fn open_transport(&self, registry: &TransportRegistry) -> Result<Arc<dyn SyncTransport>> {
        registry.open(&self.transport)
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

impl Default for SyncConfig {
    /// A freshly generated client identifier.
    fn default() -> Self {
        Self::new(ClientId::generate())
    }
}
