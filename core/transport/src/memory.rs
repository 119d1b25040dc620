//! In-memory sync transport for testing.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::transport::{
    check_continuation, validate_batch, ClientInfo, DocumentInfo, RootMarker, SyncTransport,
};
use docsync_common::{ClientId, DocumentId, Error, Result, SyncChange};

/// In-memory document structure.
#[derive(Debug, Clone)]
struct DocumentEntry {
    info: DocumentInfo,
    /// Change streams keyed by origin, each ordered by sequence.
    streams: BTreeMap<ClientId, Vec<SyncChange>>,
}

#[derive(Debug, Default)]
struct Fabric {
    marker: Option<RootMarker>,
    clients: HashMap<ClientId, ClientInfo>,
    documents: HashMap<DocumentId, DocumentEntry>,
}

/// In-memory sync transport.
///
/// Useful for testing and for several managers in one process sharing a
/// fabric. Clones share the same underlying state; everything is lost when
/// the last clone is dropped.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    fabric: Arc<RwLock<Fabric>>,
}

impl MemoryTransport {
    /// Create a new, empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered clients, for inspection.
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.fabric.read().clients.values().cloned().collect()
    }
}

#[async_trait]
impl SyncTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn root_exists(&self) -> Result<bool> {
        Ok(self.fabric.read().marker.is_some())
    }

    async fn create_root(&self, marker: &RootMarker) -> Result<()> {
        let mut fabric = self.fabric.write();
        if fabric.marker.is_some() {
            return Err(Error::AlreadyExists("Sync root already exists".to_string()));
        }
        fabric.marker = Some(marker.clone());
        Ok(())
    }

    async fn read_root(&self) -> Result<RootMarker> {
        self.fabric
            .read()
            .marker
            .clone()
            .ok_or_else(|| Error::NotFound("Sync root not found".to_string()))
    }

    async fn remove_root(&self) -> Result<()> {
        *self.fabric.write() = Fabric::default();
        Ok(())
    }

    async fn register_client(&self, client: &ClientInfo) -> Result<()> {
        let mut fabric = self.fabric.write();
        if fabric.marker.is_none() {
            return Err(Error::NotFound("Sync root not found".to_string()));
        }
        fabric.clients.insert(client.client.clone(), client.clone());
        Ok(())
    }

    async fn document_exists(&self, document: &DocumentId) -> Result<bool> {
        Ok(self.fabric.read().documents.contains_key(document))
    }

    async fn create_document(&self, info: &DocumentInfo) -> Result<()> {
        let mut fabric = self.fabric.write();
        if fabric.marker.is_none() {
            return Err(Error::NotFound("Sync root not found".to_string()));
        }
        if fabric.documents.contains_key(&info.document) {
            return Err(Error::AlreadyExists(format!(
                "Document already exists: {}",
                info.document
            )));
        }

        fabric.documents.insert(
            info.document.clone(),
            DocumentEntry {
                info: info.clone(),
                streams: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_document(&self, document: &DocumentId) -> Result<DocumentInfo> {
        self.fabric
            .read()
            .documents
            .get(document)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| Error::NotFound(format!("Document not found: {}", document)))
    }

    async fn remove_document(&self, document: &DocumentId) -> Result<()> {
        self.fabric.write().documents.remove(document);
        Ok(())
    }

    async fn append_changes(&self, document: &DocumentId, records: &[SyncChange]) -> Result<()> {
        validate_batch(document, records)?;

        let mut fabric = self.fabric.write();
        let entry = fabric
            .documents
            .get_mut(document)
            .ok_or_else(|| Error::NotFound(format!("Document not found: {}", document)))?;

        let stream = entry.streams.entry(records[0].origin.clone()).or_default();
        let last = stream.last().map(|r| r.sequence).unwrap_or(0);
        check_continuation(&records[0].origin, last, records[0].sequence)?;

        stream.extend_from_slice(records);
        Ok(())
    }

    async fn read_changes_since(
        &self,
        document: &DocumentId,
        origin: &ClientId,
        since: u64,
    ) -> Result<Vec<SyncChange>> {
        let fabric = self.fabric.read();
        let entry = fabric
            .documents
            .get(document)
            .ok_or_else(|| Error::NotFound(format!("Document not found: {}", document)))?;

        Ok(entry
            .streams
            .get(origin)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|r| r.sequence > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn change_origins(&self, document: &DocumentId) -> Result<Vec<ClientId>> {
        let fabric = self.fabric.read();
        let entry = fabric
            .documents
            .get(document)
            .ok_or_else(|| Error::NotFound(format!("Document not found: {}", document)))?;

        Ok(entry.streams.keys().cloned().collect())
    }
}
