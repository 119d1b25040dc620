//! Registration operations.
//!
//! Both operations only use the [`SyncTransport`] primitives; a new medium
//! adds a transport, never a new registration operation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use docsync_common::{ApplicationId, DocumentId, Error, RegistrationError, Result};
use docsync_transport::{ClientInfo, DocumentInfo, FormatVersion, RootMarker, SyncTransport};

use crate::helper::HelperArea;
use crate::operation::{Checkpoint, OperationOutcome, OperationTask};

/// Progress reported by a running registration operation.
#[derive(Debug)]
pub enum RegistrationEvent {
    /// Non-fatal problem; registration continues.
    Diagnostic(Error),
    /// The document structure is missing; the operation waits for a helper
    /// location.
    AwaitingStructure {
        document: DocumentId,
        description: String,
        metadata: BTreeMap<String, Value>,
    },
}

/// Sending half of a registration event channel.
pub type RegistrationEvents = mpsc::UnboundedSender<RegistrationEvent>;

/// Wait for a started registration, handing each event to `on_event` as it
/// arrives.
///
/// Events still queued when the operation ends are delivered before the
/// outcome is returned.
pub(crate) async fn drive<F>(
    mut handle: JoinHandle<OperationOutcome>,
    events: &mut mpsc::UnboundedReceiver<RegistrationEvent>,
    mut on_event: F,
) -> OperationOutcome
where
    F: FnMut(RegistrationEvent),
{
    let outcome = loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => on_event(event),
            joined = &mut handle => {
                break joined.unwrap_or_else(|e| {
                    OperationOutcome::Failed(Error::InvalidState(format!(
                        "registration task aborted: {}",
                        e
                    )))
                })
            }
        }
    };

    while let Ok(event) = events.try_recv() {
        on_event(event);
    }
    outcome
}

/// Stands up or verifies the sync fabric root for an application.
pub struct ApplicationRegistrationOperation {
    transport: Arc<dyn SyncTransport>,
    application: ApplicationId,
    client: ClientInfo,
    events: RegistrationEvents,
}

impl ApplicationRegistrationOperation {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        application: ApplicationId,
        client: ClientInfo,
        events: RegistrationEvents,
    ) -> Self {
        Self {
            transport,
            application,
            client,
            events,
        }
    }

    fn diagnostic(&self, error: Error) {
        warn!("Registration of {}: {}", self.application, error);
        let _ = self.events.send(RegistrationEvent::Diagnostic(error));
    }

    async fn validate_root(&self) -> Result<()> {
        let marker = self.transport.read_root().await?;

        if marker.application != self.application {
            return Err(RegistrationError::InvalidStructure(format!(
                "root belongs to application {}, not {}",
                marker.application, self.application
            ))
            .into());
        }

        let incompatible = RegistrationError::IncompatibleVersion {
            found: marker.format.to_string(),
            supported: FormatVersion::CURRENT.to_string(),
        };
        if !marker.format.is_compatible() {
            return Err(incompatible.into());
        }
        if marker.format.is_newer_minor() {
            self.diagnostic(incompatible.into());
        }

        debug!("Validated existing root for {}", self.application);
        Ok(())
    }
}

#[async_trait]
impl OperationTask for ApplicationRegistrationOperation {
    fn name(&self) -> &'static str {
        "application registration"
    }

    async fn run(&self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.check()?;

        let exists = self
            .transport
            .root_exists()
            .await
            .map_err(|e| RegistrationError::RemoteUnreachable(e.to_string()))?;
        checkpoint.check()?;

        if exists {
            self.validate_root().await?;
        } else {
            info!("Creating sync root for {}", self.application);
            self.transport
                .create_root(&RootMarker::new(self.application.clone()))
                .await?;

            if checkpoint.is_cancelled() {
                info!("Cancelled after root creation, removing root for {}", self.application);
                self.transport.remove_root().await?;
                return Err(Error::Cancelled);
            }
        }

        if let Err(e) = self.transport.register_client(&self.client).await {
            self.diagnostic(e);
        }

        Ok(())
    }
}

/// Stands up or verifies the remote structure of one document.
///
/// When the structure is missing the operation suspends until a helper
/// location arrives on the channel returned by [`Self::new`]. Dropping the
/// sender counts as cancellation.
pub struct DocumentRegistrationOperation {
    transport: Arc<dyn SyncTransport>,
    info: DocumentInfo,
    events: RegistrationEvents,
    helper_rx: Mutex<Option<oneshot::Receiver<PathBuf>>>,
    helper: Mutex<Option<PathBuf>>,
}

impl DocumentRegistrationOperation {
    pub fn new(
        transport: Arc<dyn SyncTransport>,
        info: DocumentInfo,
        events: RegistrationEvents,
    ) -> (Self, oneshot::Sender<PathBuf>) {
        let (helper_tx, helper_rx) = oneshot::channel();
        let operation = Self {
            transport,
            info,
            events,
            helper_rx: Mutex::new(Some(helper_rx)),
            helper: Mutex::new(None),
        };
        (operation, helper_tx)
    }

    /// Helper location the structure was created with, once supplied.
    pub fn helper(&self) -> Option<PathBuf> {
        self.helper.lock().clone()
    }

    async fn await_helper(&self, checkpoint: &Checkpoint) -> Result<PathBuf> {
        let receiver = self
            .helper_rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("helper location already consumed".to_string()))?;

        let _ = self.events.send(RegistrationEvent::AwaitingStructure {
            document: self.info.document.clone(),
            description: self.info.description.clone(),
            metadata: self.info.metadata.clone(),
        });

        tokio::select! {
            _ = checkpoint.cancelled() => Err(Error::Cancelled),
            received = receiver => received.map_err(|_| Error::Cancelled),
        }
    }

    async fn create_structure(&self, area: &HelperArea, checkpoint: &Checkpoint) -> Result<()> {
        let document = &self.info.document;

        area.stage_document(&self.info).await?;
        if checkpoint.is_cancelled() {
            area.discard_staged().await?;
            return Err(Error::Cancelled);
        }

        if let Err(e) = self.transport.create_document(&self.info).await {
            if let Err(cleanup) = area.discard_staged().await {
                warn!("Could not discard staged {}: {}", document, cleanup);
            }
            return Err(e);
        }

        if checkpoint.is_cancelled() {
            info!("Cancelled after creating {}, removing it", document);
            self.transport.remove_document(document).await?;
            area.discard_staged().await?;
            return Err(Error::Cancelled);
        }

        area.commit_staged().await
    }
}

#[async_trait]
impl OperationTask for DocumentRegistrationOperation {
    fn name(&self) -> &'static str {
        "document registration"
    }

    async fn run(&self, checkpoint: &Checkpoint) -> Result<()> {
        let document = &self.info.document;
        checkpoint.check()?;

        if self.transport.document_exists(document).await? {
            let remote = self.transport.read_document(document).await?;
            if remote.document != *document {
                return Err(RegistrationError::InvalidStructure(format!(
                    "structure of {} describes {}",
                    document, remote.document
                ))
                .into());
            }
            debug!("Remote structure for {} already exists", document);
            return Ok(());
        }

        checkpoint.check()?;
        info!("Remote structure for {} missing, awaiting helper location", document);
        let helper = self.await_helper(checkpoint).await?;
        *self.helper.lock() = Some(helper.clone());

        info!("Creating remote structure for {} (helper {})", document, helper.display());
        let area = HelperArea::open(&helper).await?;
        self.create_structure(&area, checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Operation, OperationOutcome};
    use chrono::Utc;
    use docsync_common::ClientId;
    use docsync_transport::MemoryTransport;
    use tempfile::TempDir;

    fn app() -> ApplicationId {
        ApplicationId::new("app-1").unwrap()
    }

    fn client() -> ClientInfo {
        ClientInfo {
            client: ClientId::new("c1").unwrap(),
            description: "laptop".to_string(),
            registered_at: Utc::now(),
        }
    }

    fn document_info() -> DocumentInfo {
        DocumentInfo {
            document: DocumentId::new("doc-1").unwrap(),
            description: "Shopping List".to_string(),
            metadata: BTreeMap::new(),
            created_by: ClientId::new("c1").unwrap(),
            created_at: Utc::now(),
        }
    }

    fn application_operation(
        transport: &MemoryTransport,
    ) -> (
        Arc<Operation<ApplicationRegistrationOperation>>,
        mpsc::UnboundedReceiver<RegistrationEvent>,
    ) {
        let (events, receiver) = mpsc::unbounded_channel();
        let task =
            ApplicationRegistrationOperation::new(Arc::new(transport.clone()), app(), client(), events);
        (Arc::new(Operation::new(task)), receiver)
    }

    #[tokio::test]
    async fn test_creates_missing_root() {
        let transport = MemoryTransport::new();
        let (operation, _events) = application_operation(&transport);

        let outcome = operation.run().await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Completed));
        assert_eq!(transport.read_root().await.unwrap().application, app());
        assert_eq!(transport.clients().len(), 1);
    }

    #[tokio::test]
    async fn test_validates_existing_root() {
        let transport = MemoryTransport::new();
        transport.create_root(&RootMarker::new(app())).await.unwrap();
        let (operation, mut events) = application_operation(&transport);

        let outcome = operation.run().await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Completed));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_foreign_root() {
        let transport = MemoryTransport::new();
        transport
            .create_root(&RootMarker::new(ApplicationId::new("other").unwrap()))
            .await
            .unwrap();
        let (operation, _events) = application_operation(&transport);

        let outcome = operation.run().await.unwrap();
        assert!(matches!(
            outcome,
            OperationOutcome::Failed(Error::Registration(RegistrationError::InvalidStructure(_)))
        ));
    }

    #[tokio::test]
    async fn test_incompatible_and_newer_versions() {
        let transport = MemoryTransport::new();
        let mut marker = RootMarker::new(app());
        marker.format = FormatVersion { major: 2, minor: 0 };
        transport.create_root(&marker).await.unwrap();

        let (operation, _events) = application_operation(&transport);
        let outcome = operation.run().await.unwrap();
        assert!(matches!(
            outcome,
            OperationOutcome::Failed(Error::Registration(RegistrationError::IncompatibleVersion { .. }))
        ));

        transport.remove_root().await.unwrap();
        marker.format = FormatVersion { major: 1, minor: 3 };
        transport.create_root(&marker).await.unwrap();

        let (operation, mut events) = application_operation(&transport);
        let outcome = operation.run().await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Completed));
        assert!(matches!(
            events.try_recv().unwrap(),
            RegistrationEvent::Diagnostic(Error::Registration(RegistrationError::IncompatibleVersion { .. }))
        ));
    }

    #[tokio::test]
    async fn test_existing_document_needs_no_helper() {
        let transport = MemoryTransport::new();
        transport.create_root(&RootMarker::new(app())).await.unwrap();
        transport.create_document(&document_info()).await.unwrap();

        let (events, mut receiver) = mpsc::unbounded_channel();
        let (task, _helper_tx) =
            DocumentRegistrationOperation::new(Arc::new(transport.clone()), document_info(), events);
        let operation = Arc::new(Operation::new(task));

        let outcome = operation.run().await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Completed));
        assert!(receiver.try_recv().is_err());
        assert!(operation.task().helper().is_none());
    }

    #[tokio::test]
    async fn test_missing_document_waits_for_helper() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        transport.create_root(&RootMarker::new(app())).await.unwrap();

        let (events, mut receiver) = mpsc::unbounded_channel();
        let (task, helper_tx) =
            DocumentRegistrationOperation::new(Arc::new(transport.clone()), document_info(), events);
        let operation = Arc::new(Operation::new(task));
        let handle = operation.start().unwrap();

        match receiver.recv().await.unwrap() {
            RegistrationEvent::AwaitingStructure {
                document,
                description,
                metadata,
            } => {
                assert_eq!(document.as_str(), "doc-1");
                assert_eq!(description, "Shopping List");
                assert!(metadata.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        helper_tx.send(temp.path().to_path_buf()).unwrap();
        let outcome = handle.await.unwrap();

        assert!(matches!(outcome, OperationOutcome::Completed));
        assert!(transport
            .document_exists(&DocumentId::new("doc-1").unwrap())
            .await
            .unwrap());
        assert_eq!(operation.task().helper().as_deref(), Some(temp.path()));
        assert!(temp.path().join(crate::helper::DOCUMENT_FILENAME).exists());
    }

    #[tokio::test]
    async fn test_cancel_while_awaiting_helper() {
        let transport = MemoryTransport::new();
        transport.create_root(&RootMarker::new(app())).await.unwrap();

        let (events, mut receiver) = mpsc::unbounded_channel();
        let (task, _helper_tx) =
            DocumentRegistrationOperation::new(Arc::new(transport.clone()), document_info(), events);
        let operation = Arc::new(Operation::new(task));
        let handle = operation.start().unwrap();

        receiver.recv().await.unwrap();
        operation.cancel();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Cancelled));
        assert!(!transport
            .document_exists(&DocumentId::new("doc-1").unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_dropped_helper_sender_cancels() {
        let transport = MemoryTransport::new();
        transport.create_root(&RootMarker::new(app())).await.unwrap();

        let (events, _receiver) = mpsc::unbounded_channel();
        let (task, helper_tx) =
            DocumentRegistrationOperation::new(Arc::new(transport), document_info(), events);
        drop(helper_tx);

        let outcome = Arc::new(Operation::new(task)).run().await.unwrap();
        assert!(matches!(outcome, OperationOutcome::Cancelled));
    }
}
