//! Application-level registration and ownership of document managers.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{error, info};

use docsync_common::{ApplicationId, DocumentId, Error, Result};
use docsync_transport::{ClientInfo, SyncTransport};

use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, StrategyResolver};
use crate::context::{ObjectStore, SynchronizedObjectContext};
use crate::document::{DocumentSyncManager, DocumentSyncManagerDelegate};
use crate::operation::{Operation, OperationOutcome};
use crate::registration::{drive, ApplicationRegistrationOperation, RegistrationEvent};

/// Registration state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationRegistrationState {
    Unregistered,
    Registering,
    Registered,
    Failed,
}

/// Callbacks of an [`ApplicationSyncManager`]. All members are optional.
///
/// For one `register()` call the order is: `registration_started`, zero or
/// more `registration_error`, then exactly one of `registration_failed`,
/// `registration_succeeded` or `registration_cancelled`.
pub trait ApplicationSyncManagerDelegate: Send + Sync {
    fn registration_started(&self, _manager: &ApplicationSyncManager) {}

    /// Non-fatal diagnostic; registration continues.
    fn registration_error(&self, _manager: &ApplicationSyncManager, _error: &Error) {}

    fn registration_failed(&self, _manager: &ApplicationSyncManager, _error: &Error) {}

    fn registration_succeeded(&self, _manager: &ApplicationSyncManager) {}

    fn registration_cancelled(&self, _manager: &ApplicationSyncManager) {}
}

/// Delegate that ignores every callback.
pub struct NoopApplicationDelegate;

impl ApplicationSyncManagerDelegate for NoopApplicationDelegate {}

/// Registers an application with a sync fabric root and owns its
/// [`DocumentSyncManager`]s.
pub struct ApplicationSyncManager {
    me: Weak<Self>,
    config: SyncConfig,
    application: ApplicationId,
    transport: Arc<dyn SyncTransport>,
    delegate: Arc<dyn ApplicationSyncManagerDelegate>,
    state: Mutex<ApplicationRegistrationState>,
    in_flight: Mutex<Option<Arc<Operation<ApplicationRegistrationOperation>>>>,
    documents: RwLock<HashMap<DocumentId, Arc<DocumentSyncManager>>>,
}

impl ApplicationSyncManager {
    pub fn new(
        config: SyncConfig,
        application: ApplicationId,
        transport: Arc<dyn SyncTransport>,
        delegate: Arc<dyn ApplicationSyncManagerDelegate>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            application,
            transport,
            delegate,
            state: Mutex::new(ApplicationRegistrationState::Unregistered),
            in_flight: Mutex::new(None),
            documents: RwLock::new(HashMap::new()),
        })
    }

    pub fn application(&self) -> &ApplicationId {
        &self.application
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn SyncTransport> {
        &self.transport
    }

    pub fn state(&self) -> ApplicationRegistrationState {
        *self.state.lock()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == ApplicationRegistrationState::Registered
    }

    /// Register the application against the sync fabric root.
    ///
    /// Creates the root if it is missing, validates it otherwise, then records
    /// this client under it. A failed or cancelled registration may be
    /// retried with a fresh call.
    ///
    /// # Errors
    /// - [`Error::AlreadyRegistering`] if a registration is in flight
    /// - [`Error::InvalidState`] if already registered
    /// - [`Error::Cancelled`] if cancelled; the state returns to unregistered
    /// - The operation's failure, verbatim
    pub async fn register(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ApplicationRegistrationState::Registering => return Err(Error::AlreadyRegistering),
                ApplicationRegistrationState::Registered => {
                    return Err(Error::InvalidState(format!(
                        "{} is already registered",
                        self.application
                    )))
                }
                _ => *state = ApplicationRegistrationState::Registering,
            }
        }

        info!("Registering application {}", self.application);
        self.delegate.registration_started(self);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let client = ClientInfo {
            client: self.config.client.clone(),
            description: self.config.client_description.clone(),
            registered_at: Utc::now(),
        };
        let operation = Arc::new(Operation::new(ApplicationRegistrationOperation::new(
            self.transport.clone(),
            self.application.clone(),
            client,
            events_tx,
        )));
        *self.in_flight.lock() = Some(operation.clone());

        let outcome = match operation.start() {
            Ok(handle) => {
                drive(handle, &mut events, |event| {
                    if let RegistrationEvent::Diagnostic(e) = event {
                        self.delegate.registration_error(self, &e);
                    }
                })
                .await
            }
            // Only a cancelled operation refuses to start.
            Err(_) => OperationOutcome::Cancelled,
        };
        *self.in_flight.lock() = None;

        match outcome {
            OperationOutcome::Completed => {
                *self.state.lock() = ApplicationRegistrationState::Registered;
                info!("Application {} registered", self.application);
                self.delegate.registration_succeeded(self);
                Ok(())
            }
            OperationOutcome::Cancelled => {
                *self.state.lock() = ApplicationRegistrationState::Unregistered;
                info!("Registration of {} cancelled", self.application);
                self.delegate.registration_cancelled(self);
                Err(Error::Cancelled)
            }
            OperationOutcome::Failed(e) => {
                *self.state.lock() = ApplicationRegistrationState::Failed;
                error!("Registration of {} failed: {}", self.application, e);
                self.delegate.registration_failed(self, &e);
                Err(e)
            }
        }
    }

    /// Cancel the in-flight registration, if any.
    ///
    /// Returns whether there was one to cancel.
    pub fn cancel_registration(&self) -> bool {
        let operation = self.in_flight.lock().clone();
        match operation {
            Some(operation) => {
                operation.cancel();
                true
            }
            None => false,
        }
    }

    /// Create the manager of a document, using the configured conflict
    /// strategy.
    ///
    /// # Errors
    /// - [`Error::AlreadyExists`] if the document already has a manager
    pub fn document_sync_manager(
        &self,
        document: DocumentId,
        description: impl Into<String>,
        metadata: BTreeMap<String, Value>,
        store: Arc<dyn ObjectStore>,
        delegate: Arc<dyn DocumentSyncManagerDelegate>,
    ) -> Result<Arc<DocumentSyncManager>> {
        let resolver = Arc::new(StrategyResolver::new(
            self.config.conflict_strategy,
            self.config.client.clone(),
        ));
        self.document_sync_manager_with_resolver(
            document,
            description,
            metadata,
            store,
            resolver,
            delegate,
        )
    }

    /// Create the manager of a document with a custom conflict resolver.
    ///
    /// # Errors
    /// - [`Error::AlreadyExists`] if the document already has a manager
    pub fn document_sync_manager_with_resolver(
        &self,
        document: DocumentId,
        description: impl Into<String>,
        metadata: BTreeMap<String, Value>,
        store: Arc<dyn ObjectStore>,
        resolver: Arc<dyn ConflictResolver>,
        delegate: Arc<dyn DocumentSyncManagerDelegate>,
    ) -> Result<Arc<DocumentSyncManager>> {
        let mut documents = self.documents.write();
        if documents.contains_key(&document) {
            return Err(Error::AlreadyExists(format!(
                "Document {} already has a manager",
                document
            )));
        }

        let context = Arc::new(SynchronizedObjectContext::new(document.clone(), store, resolver));
        let manager = DocumentSyncManager::new(
            self.me.clone(),
            document.clone(),
            description.into(),
            metadata,
            &self.config,
            self.transport.clone(),
            context,
            delegate,
        );
        documents.insert(document, manager.clone());
        Ok(manager)
    }

    /// Manager of a document, if one was created.
    pub fn document(&self, document: &DocumentId) -> Option<Arc<DocumentSyncManager>> {
        self.documents.read().get(document).cloned()
    }

    /// All document managers.
    pub fn documents(&self) -> Vec<Arc<DocumentSyncManager>> {
        self.documents.read().values().cloned().collect()
    }
}
