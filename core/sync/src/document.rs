//! Per-document registration and the change pipeline.
//!
//! # Registration
//! `Unregistered → Registering → {PausedAwaitingStructure, Registered, Failed}`
//! and `PausedAwaitingStructure → Registering` on resume. When the remote
//! structure is missing the manager pauses and asks its delegate for a helper
//! location; registration cannot finish without one.
//!
//! # Pipeline
//! Once registered, saves reported to the [`SynchronizedObjectContext`] are
//! processed one at a time on a background task and appended to this
//! client's stream. Remote streams are pulled on demand or by the
//! [`PullScheduler`].

use chrono::Utc;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use docsync_common::{ClientId, DocumentId, Error, RegistrationError, Result, SyncChange};
use docsync_transport::{DocumentInfo, SyncTransport};

use crate::application::ApplicationSyncManager;
use crate::config::SyncConfig;
use crate::context::{ApplyOutcome, SaveSet, SynchronizedObjectContext};
use crate::cursor::SyncCursor;
use crate::helper::HelperArea;
use crate::log::ChangeLog;
use crate::operation::{Operation, OperationOutcome};
use crate::registration::{drive, DocumentRegistrationOperation, RegistrationEvent};
use crate::scheduler::{PullResult, PullScheduler, SyncMode};

/// Registration state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentRegistrationState {
    Unregistered,
    Registering,
    PausedAwaitingStructure,
    Registered,
    Failed,
}

/// Callbacks of a [`DocumentSyncManager`].
///
/// `paused_awaiting_remote_structure` is required; everything else defaults
/// to doing nothing.
pub trait DocumentSyncManagerDelegate: Send + Sync {
    fn registration_started(&self, _manager: &DocumentSyncManager) {}

    /// Non-fatal diagnostic; registration continues.
    fn registration_error(&self, _manager: &DocumentSyncManager, _error: &Error) {}

    /// The remote structure of `document` does not exist yet.
    ///
    /// Return the helper location to create it with. Returning `None` leaves
    /// the manager paused until [`DocumentSyncManager::resume_registration`]
    /// or [`DocumentSyncManager::cancel_registration`] is called.
    fn paused_awaiting_remote_structure(
        &self,
        manager: &DocumentSyncManager,
        document: &DocumentId,
        description: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> Option<PathBuf>;

    fn registration_resumed(&self, _manager: &DocumentSyncManager) {}

    fn registration_failed(&self, _manager: &DocumentSyncManager, _error: &Error) {}

    fn registration_succeeded(&self, _manager: &DocumentSyncManager) {}

    fn registration_cancelled(&self, _manager: &DocumentSyncManager) {}

    /// Helper location of a document whose structure may already exist.
    ///
    /// Asked once at the start of every registration.
    fn helper_location(&self, _manager: &DocumentSyncManager, _document: &DocumentId) -> Option<PathBuf> {
        None
    }

    /// A save was committed to the change log.
    fn save_processing_began(&self, _manager: &DocumentSyncManager, _context: &SynchronizedObjectContext) {}

    /// A save could not be processed; none of it was committed.
    fn save_processing_failed(
        &self,
        _manager: &DocumentSyncManager,
        _context: &SynchronizedObjectContext,
        _error: &Error,
    ) {
    }

    /// A pull changed the local store.
    fn remote_changes_applied(&self, _manager: &DocumentSyncManager, _count: usize) {}
}

struct InFlight {
    operation: Arc<Operation<DocumentRegistrationOperation>>,
    helper_tx: Option<oneshot::Sender<PathBuf>>,
}

/// Registers one document and runs its change pipeline.
pub struct DocumentSyncManager {
    me: Weak<Self>,
    application: Weak<ApplicationSyncManager>,
    document: DocumentId,
    description: String,
    metadata: BTreeMap<String, Value>,
    client: ClientId,
    sync_mode: SyncMode,
    transport: Arc<dyn SyncTransport>,
    context: Arc<SynchronizedObjectContext>,
    delegate: Arc<dyn DocumentSyncManagerDelegate>,
    state: Mutex<DocumentRegistrationState>,
    registration: Mutex<Option<InFlight>>,
    log: RwLock<Option<Arc<ChangeLog>>>,
    cursor: Mutex<SyncCursor>,
    /// Also serializes pulls.
    helper: tokio::sync::Mutex<Option<HelperArea>>,
    helper_path: Mutex<Option<PathBuf>>,
    scheduler: Mutex<Option<PullScheduler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DocumentSyncManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        application: Weak<ApplicationSyncManager>,
        document: DocumentId,
        description: String,
        metadata: BTreeMap<String, Value>,
        config: &SyncConfig,
        transport: Arc<dyn SyncTransport>,
        context: Arc<SynchronizedObjectContext>,
        delegate: Arc<dyn DocumentSyncManagerDelegate>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            application,
            document,
            description,
            metadata,
            client: config.client.clone(),
            sync_mode: config.sync_mode,
            transport,
            context,
            delegate,
            state: Mutex::new(DocumentRegistrationState::Unregistered),
            registration: Mutex::new(None),
            log: RwLock::new(None),
            cursor: Mutex::new(SyncCursor::new()),
            helper: tokio::sync::Mutex::new(None),
            helper_path: Mutex::new(None),
            scheduler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn state(&self) -> DocumentRegistrationState {
        *self.state.lock()
    }

    pub fn is_registered(&self) -> bool {
        self.state() == DocumentRegistrationState::Registered
    }

    /// The owning application manager, while it is alive.
    pub fn application(&self) -> Option<Arc<ApplicationSyncManager>> {
        self.application.upgrade()
    }

    /// The context the host reports saves to.
    pub fn context(&self) -> &Arc<SynchronizedObjectContext> {
        &self.context
    }

    /// This client's change log, once registered.
    pub fn change_log(&self) -> Option<Arc<ChangeLog>> {
        self.log.read().clone()
    }

    /// Snapshot of the document's position in the change streams.
    pub fn cursor(&self) -> SyncCursor {
        self.cursor.lock().clone()
    }

    /// Helper location in use, if any.
    pub fn helper_path(&self) -> Option<PathBuf> {
        self.helper_path.lock().clone()
    }

    /// Register the document's remote structure.
    ///
    /// Suspends while paused awaiting structure; see
    /// [`DocumentSyncManagerDelegate::paused_awaiting_remote_structure`].
    ///
    /// # Preconditions
    /// - The owning application is registered
    ///
    /// # Postconditions
    /// - On success the save pipeline is running
    ///
    /// # Errors
    /// - [`Error::AlreadyRegistering`] if a registration is in flight
    /// - [`Error::InvalidState`] if already registered
    /// - [`RegistrationError::ApplicationNotRegistered`] if the precondition
    ///   does not hold
    /// - [`Error::Cancelled`] if cancelled; the state returns to unregistered
    /// - The operation's failure, verbatim
    pub async fn register(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                DocumentRegistrationState::Registering
                | DocumentRegistrationState::PausedAwaitingStructure => {
                    return Err(Error::AlreadyRegistering)
                }
                DocumentRegistrationState::Registered => {
                    return Err(Error::InvalidState(format!(
                        "{} is already registered",
                        self.document
                    )))
                }
                _ => *state = DocumentRegistrationState::Registering,
            }
        }

        info!("Registering document {}", self.document);
        self.delegate.registration_started(self);

        let application_registered = self
            .application
            .upgrade()
            .is_some_and(|application| application.is_registered());
        if !application_registered {
            let application = self
                .application
                .upgrade()
                .map(|a| a.application().to_string())
                .unwrap_or_else(|| "<dropped>".to_string());
            return self.fail(RegistrationError::ApplicationNotRegistered(application).into());
        }

        let known_helper = self.delegate.helper_location(self, &self.document);

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let info = DocumentInfo {
            document: self.document.clone(),
            description: self.description.clone(),
            metadata: self.metadata.clone(),
            created_by: self.client.clone(),
            created_at: Utc::now(),
        };
        let (task, helper_tx) =
            DocumentRegistrationOperation::new(self.transport.clone(), info, events_tx);
        let operation = Arc::new(Operation::new(task));
        *self.registration.lock() = Some(InFlight {
            operation: operation.clone(),
            helper_tx: Some(helper_tx),
        });

        let outcome = match operation.start() {
            Ok(handle) => {
                drive(handle, &mut events, |event| match event {
                    RegistrationEvent::Diagnostic(e) => self.delegate.registration_error(self, &e),
                    RegistrationEvent::AwaitingStructure {
                        document,
                        description,
                        metadata,
                    } => self.pause(&document, &description, &metadata),
                })
                .await
            }
            // Only a cancelled operation refuses to start.
            Err(_) => OperationOutcome::Cancelled,
        };
        *self.registration.lock() = None;

        match outcome {
            OperationOutcome::Completed => {
                let helper = operation.task().helper().or(known_helper);
                if let Err(e) = self.attach(helper).await {
                    return self.fail(e);
                }
                *self.state.lock() = DocumentRegistrationState::Registered;
                info!("Document {} registered", self.document);
                self.delegate.registration_succeeded(self);
                Ok(())
            }
            OperationOutcome::Cancelled => {
                *self.state.lock() = DocumentRegistrationState::Unregistered;
                info!("Registration of {} cancelled", self.document);
                self.delegate.registration_cancelled(self);
                Err(Error::Cancelled)
            }
            OperationOutcome::Failed(e) => self.fail(e),
        }
    }

    /// Supply the helper location of a paused registration.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] if the manager is not paused
    pub fn resume_registration(&self, helper: PathBuf) -> Result<()> {
        let helper_tx = {
            let mut state = self.state.lock();
            if *state != DocumentRegistrationState::PausedAwaitingStructure {
                return Err(Error::InvalidState(format!(
                    "{} is not awaiting a helper location ({:?})",
                    self.document, *state
                )));
            }
            let helper_tx = self
                .registration
                .lock()
                .as_mut()
                .and_then(|in_flight| in_flight.helper_tx.take())
                .ok_or_else(|| {
                    Error::InvalidState(format!("{} has no paused registration", self.document))
                })?;
            *state = DocumentRegistrationState::Registering;
            helper_tx
        };

        info!("Resuming registration of {} with helper {}", self.document, helper.display());
        self.delegate.registration_resumed(self);

        helper_tx.send(helper).map_err(|_| {
            Error::InvalidState(format!("registration of {} already ended", self.document))
        })
    }

    /// Cancel the in-flight registration, if any.
    ///
    /// Returns whether there was one to cancel. The pending `register()` call
    /// returns [`Error::Cancelled`] and the manager goes back to unregistered.
    pub fn cancel_registration(&self) -> bool {
        let operation = self
            .registration
            .lock()
            .as_ref()
            .map(|in_flight| in_flight.operation.clone());
        match operation {
            Some(operation) => {
                operation.cancel();
                true
            }
            None => false,
        }
    }

    /// Pull every other client's stream and apply new records.
    ///
    /// Records of all origins are applied together in change stamp order,
    /// so a write that followed another client's write is applied after it.
    /// Pulls run one at a time. The cursor is persisted to the helper area,
    /// when there is one.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] if the document is not registered
    /// - Transport and store errors; records applied before the error stay
    ///   applied and are skipped by the next pull
    pub async fn pull_remote_changes(&self) -> Result<PullResult> {
        let log = self
            .change_log()
            .filter(|_| self.is_registered())
            .ok_or_else(|| Error::InvalidState(format!("{} is not registered", self.document)))?;

        let started = Instant::now();
        let mut helper = self.helper.lock().await;

        let origins: Vec<ClientId> = self
            .transport
            .change_origins(&self.document)
            .await?
            .into_iter()
            .filter(|origin| *origin != self.client)
            .collect();
        let since: Vec<u64> = {
            let cursor = self.cursor.lock();
            origins.iter().map(|origin| cursor.applied_for(origin)).collect()
        };

        let streams = try_join_all(
            origins
                .iter()
                .zip(since)
                .map(|(origin, since)| log.read_since(origin, since)),
        )
        .await?;

        let mut records: Vec<SyncChange> = streams.into_iter().flatten().collect();
        records.sort_by_cached_key(SyncChange::stamp);

        let mut applied = 0;
        for record in &records {
            if self.context.apply_remote(record)? == ApplyOutcome::Applied {
                applied += 1;
            }
            self.cursor.lock().mark_applied(&record.origin, record.sequence);
        }

        let snapshot = {
            let mut cursor = self.cursor.lock();
            cursor.mark_pulled();
            cursor.clone()
        };
        if let Some(area) = helper.as_mut() {
            area.persist_cursor(&snapshot).await?;
        }

        debug!(
            "Pulled {} from {} origin(s), {} record(s) applied",
            self.document,
            origins.len(),
            applied
        );
        if applied > 0 {
            self.delegate.remote_changes_applied(self, applied);
        }

        Ok(PullResult {
            applied,
            origins: origins.len(),
            duration: started.elapsed(),
        })
    }

    /// Start the pull loop in the configured [`SyncMode`].
    ///
    /// Started automatically on registration in periodic mode. Calling it
    /// again returns the running scheduler.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] if the document is not registered
    pub fn start_pull_scheduler(&self) -> Result<PullScheduler> {
        if self.change_log().is_none() {
            return Err(Error::InvalidState(format!("{} is not registered", self.document)));
        }

        let mut slot = self.scheduler.lock();
        if let Some(scheduler) = slot.as_ref() {
            return Ok(scheduler.clone());
        }

        let (scheduler, handle) = PullScheduler::new(self.sync_mode);
        let manager = self.me.clone();
        let task = tokio::spawn(handle.run(move || {
            let manager = manager.clone();
            async move {
                match manager.upgrade() {
                    Some(manager) => manager.pull_remote_changes().await,
                    None => Err(Error::InvalidState("document manager dropped".to_string())),
                }
            }
        }));

        self.tasks.lock().push(task);
        *slot = Some(scheduler.clone());
        info!("Pull scheduler running for {} ({:?})", self.document, self.sync_mode);
        Ok(scheduler)
    }

    fn fail(&self, error: Error) -> Result<()> {
        *self.state.lock() = DocumentRegistrationState::Failed;
        error!("Registration of {} failed: {}", self.document, error);
        self.delegate.registration_failed(self, &error);
        Err(error)
    }

    fn pause(&self, document: &DocumentId, description: &str, metadata: &BTreeMap<String, Value>) {
        *self.state.lock() = DocumentRegistrationState::PausedAwaitingStructure;
        info!("Registration of {} paused awaiting remote structure", document);

        match self
            .delegate
            .paused_awaiting_remote_structure(self, document, description, metadata)
        {
            Some(helper) => {
                if let Err(e) = self.resume_registration(helper) {
                    warn!("Could not resume {}: {}", document, e);
                    self.delegate.registration_error(self, &e);
                }
            }
            None => debug!("{} stays paused until a helper location is supplied", document),
        }
    }

    /// Open the helper area and the change log, then start the pipeline.
    async fn attach(&self, helper: Option<PathBuf>) -> Result<()> {
        let area = match &helper {
            Some(path) => Some(HelperArea::open(path).await?),
            None => None,
        };
        let mut cursor = area.as_ref().map(|a| a.cursor().clone()).unwrap_or_default();

        let log = Arc::new(
            ChangeLog::open(
                self.document.clone(),
                self.client.clone(),
                self.transport.clone(),
                cursor.last_written,
            )
            .await?,
        );
        cursor.mark_written(log.last_written());

        *self.cursor.lock() = cursor;
        *self.helper.lock().await = area;
        *self.helper_path.lock() = helper;
        *self.log.write() = Some(log.clone());

        self.start_pipeline(log);
        if let SyncMode::Periodic { .. } = self.sync_mode {
            self.start_pull_scheduler()?;
        }
        Ok(())
    }

    fn start_pipeline(&self, log: Arc<ChangeLog>) {
        let Some(mut saves) = self.context.take_save_queue() else {
            debug!("Save pipeline for {} already running", self.document);
            return;
        };

        let manager = self.me.clone();
        let task = tokio::spawn(async move {
            while let Some(save) = saves.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.process_save(&log, save).await;
            }
        });
        self.tasks.lock().push(task);
        debug!("Save pipeline for {} started", self.document);
    }

    async fn process_save(&self, log: &ChangeLog, save: SaveSet) {
        match self.context.process_save(log, &save).await {
            Ok(records) => {
                if let Some(last) = records.last() {
                    self.cursor.lock().mark_written(last.sequence);
                }
                debug!("Save of {} committed {} record(s)", self.document, records.len());
                self.persist_cursor().await;
                self.delegate.save_processing_began(self, &self.context);
            }
            Err(e) => {
                warn!("Save of {} failed: {}", self.document, e);
                self.delegate.save_processing_failed(self, &self.context, &e);
            }
        }
    }

    /// Write the cursor to the helper area, if there is one.
    ///
    /// Failures are logged; the next open recovers from the local stream.
    async fn persist_cursor(&self) {
        let mut helper = self.helper.lock().await;
        let Some(area) = helper.as_mut() else {
            return;
        };
        let snapshot = self.cursor.lock().clone();
        if let Err(e) = area.persist_cursor(&snapshot).await {
            warn!("Could not persist cursor of {}: {}", self.document, e);
        }
    }
}

impl Drop for DocumentSyncManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{ApplicationSyncManager, NoopApplicationDelegate};
    use crate::context::{MemoryObjectStore, SynchronizedObject};
    use crate::testing::{wait_until, FlakyTransport};
    use docsync_common::{ApplicationId, Attributes, ObjectId};
    use docsync_transport::MemoryTransport;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Records callbacks and answers the pause with a fixed location.
    struct RecordingDelegate {
        answer: Option<PathBuf>,
        known_helper: Option<PathBuf>,
        /// Also resume from inside the pause callback before answering.
        resumes_itself: bool,
        events: Mutex<Vec<String>>,
    }

    impl RecordingDelegate {
        fn answering(answer: Option<PathBuf>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                known_helper: None,
                resumes_itself: false,
                events: Mutex::new(Vec::new()),
            })
        }

        fn knowing(helper: PathBuf) -> Arc<Self> {
            Arc::new(Self {
                answer: None,
                known_helper: Some(helper),
                resumes_itself: false,
                events: Mutex::new(Vec::new()),
            })
        }

        fn resuming_twice(helper: PathBuf) -> Arc<Self> {
            Arc::new(Self {
                answer: Some(helper),
                known_helper: None,
                resumes_itself: true,
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn count(&self, event: &str) -> usize {
            self.events.lock().iter().filter(|e| e.as_str() == event).count()
        }

        fn push(&self, event: impl Into<String>) {
            self.events.lock().push(event.into());
        }
    }

    impl DocumentSyncManagerDelegate for RecordingDelegate {
        fn registration_started(&self, _manager: &DocumentSyncManager) {
            self.push("started");
        }

        fn registration_error(&self, _manager: &DocumentSyncManager, _error: &Error) {
            self.push("error");
        }

        fn paused_awaiting_remote_structure(
            &self,
            manager: &DocumentSyncManager,
            document: &DocumentId,
            description: &str,
            metadata: &BTreeMap<String, Value>,
        ) -> Option<PathBuf> {
            self.push(format!(
                "paused {} {} {}",
                document,
                description,
                serde_json::to_string(metadata).unwrap()
            ));
            if self.resumes_itself {
                if let Some(helper) = &self.answer {
                    manager.resume_registration(helper.clone()).unwrap();
                }
            }
            self.answer.clone()
        }

        fn registration_resumed(&self, _manager: &DocumentSyncManager) {
            self.push("resumed");
        }

        fn registration_failed(&self, _manager: &DocumentSyncManager, _error: &Error) {
            self.push("failed");
        }

        fn registration_succeeded(&self, _manager: &DocumentSyncManager) {
            self.push("succeeded");
        }

        fn registration_cancelled(&self, _manager: &DocumentSyncManager) {
            self.push("cancelled");
        }

        fn helper_location(&self, _manager: &DocumentSyncManager, _document: &DocumentId) -> Option<PathBuf> {
            self.known_helper.clone()
        }

        fn save_processing_began(&self, _manager: &DocumentSyncManager, _context: &SynchronizedObjectContext) {
            self.push("save began");
        }

        fn save_processing_failed(
            &self,
            _manager: &DocumentSyncManager,
            _context: &SynchronizedObjectContext,
            _error: &Error,
        ) {
            self.push("save failed");
        }

        fn remote_changes_applied(&self, _manager: &DocumentSyncManager, count: usize) {
            self.push(format!("applied {}", count));
        }
    }

    async fn registered_application(
        transport: Arc<dyn SyncTransport>,
        config: SyncConfig,
    ) -> Arc<ApplicationSyncManager> {
        let application = ApplicationSyncManager::new(
            config,
            ApplicationId::new("app-1").unwrap(),
            transport,
            Arc::new(NoopApplicationDelegate),
        );
        application.register().await.unwrap();
        application
    }

    fn config(client: &str) -> SyncConfig {
        SyncConfig::new(ClientId::new(client).unwrap())
    }

    fn shopping_list(
        application: &ApplicationSyncManager,
        delegate: Arc<RecordingDelegate>,
    ) -> Arc<DocumentSyncManager> {
        application
            .document_sync_manager(
                DocumentId::new("doc-1").unwrap(),
                "Shopping List",
                BTreeMap::new(),
                Arc::new(MemoryObjectStore::new()),
                delegate,
            )
            .unwrap()
    }

    fn milk() -> SynchronizedObject {
        SynchronizedObject::new(ObjectId::new("milk").unwrap(), "Item", Attributes::new())
            .with("name", json!("milk"))
    }

    #[tokio::test]
    async fn test_first_registration_pauses_then_succeeds() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        let application = registered_application(Arc::new(transport.clone()), config("c1")).await;

        let delegate = RecordingDelegate::answering(Some(temp.path().to_path_buf()));
        let manager = shopping_list(&application, delegate.clone());
        manager.register().await.unwrap();

        assert_eq!(
            delegate.events(),
            vec!["started", "paused doc-1 Shopping List {}", "resumed", "succeeded"]
        );
        assert!(manager.is_registered());
        assert_eq!(manager.helper_path().as_deref(), Some(temp.path()));
        assert!(transport
            .document_exists(&DocumentId::new("doc-1").unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_failed_resume_from_pause_is_reported() {
        let temp = TempDir::new().unwrap();
        let application = registered_application(Arc::new(MemoryTransport::new()), config("c1")).await;
        let delegate = RecordingDelegate::resuming_twice(temp.path().to_path_buf());
        let manager = shopping_list(&application, delegate.clone());

        // The answer arrives after the delegate already resumed, so it is
        // rejected; registration still completes.
        manager.register().await.unwrap();

        assert_eq!(
            delegate.events(),
            vec!["started", "paused doc-1 Shopping List {}", "resumed", "error", "succeeded"]
        );
        assert!(manager.is_registered());
    }

    #[tokio::test]
    async fn test_existing_structure_registers_without_pause() {
        let transport = MemoryTransport::new();
        let temp = TempDir::new().unwrap();

        let first = registered_application(Arc::new(transport.clone()), config("c1")).await;
        shopping_list(&first, RecordingDelegate::answering(Some(temp.path().to_path_buf())))
            .register()
            .await
            .unwrap();

        let second = registered_application(Arc::new(transport), config("c2")).await;
        let delegate = RecordingDelegate::answering(None);
        let manager = shopping_list(&second, delegate.clone());
        manager.register().await.unwrap();

        assert_eq!(delegate.events(), vec!["started", "succeeded"]);
    }

    #[tokio::test]
    async fn test_unanswered_pause_waits_for_resume() {
        let temp = TempDir::new().unwrap();
        let application = registered_application(Arc::new(MemoryTransport::new()), config("c1")).await;
        let delegate = RecordingDelegate::answering(None);
        let manager = shopping_list(&application, delegate.clone());

        let registering = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.register().await })
        };
        wait_until(|| manager.state() == DocumentRegistrationState::PausedAwaitingStructure).await;

        assert!(matches!(manager.register().await, Err(Error::AlreadyRegistering)));
        manager.resume_registration(temp.path().to_path_buf()).unwrap();
        registering.await.unwrap().unwrap();

        assert_eq!(
            delegate.events(),
            vec!["started", "paused doc-1 Shopping List {}", "resumed", "succeeded"]
        );
        assert_eq!(delegate.count("paused doc-1 Shopping List {}"), 1);
        assert!(manager.resume_registration(temp.path().to_path_buf()).is_err());
    }

    #[tokio::test]
    async fn test_cancel_while_paused_allows_clean_retry() {
        let temp = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        let application = registered_application(Arc::new(transport.clone()), config("c1")).await;
        let delegate = RecordingDelegate::answering(None);
        let manager = shopping_list(&application, delegate.clone());

        let registering = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.register().await })
        };
        wait_until(|| manager.state() == DocumentRegistrationState::PausedAwaitingStructure).await;

        assert!(manager.cancel_registration());
        assert!(matches!(registering.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(manager.state(), DocumentRegistrationState::Unregistered);
        assert!(!transport
            .document_exists(&DocumentId::new("doc-1").unwrap())
            .await
            .unwrap());

        let registering = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.register().await })
        };
        wait_until(|| manager.state() == DocumentRegistrationState::PausedAwaitingStructure).await;
        manager.resume_registration(temp.path().to_path_buf()).unwrap();
        registering.await.unwrap().unwrap();
        assert!(manager.is_registered());
    }

    #[tokio::test]
    async fn test_document_requires_registered_application() {
        let application = ApplicationSyncManager::new(
            config("c1"),
            ApplicationId::new("app-1").unwrap(),
            Arc::new(MemoryTransport::new()),
            Arc::new(NoopApplicationDelegate),
        );
        let delegate = RecordingDelegate::answering(None);
        let manager = shopping_list(&application, delegate.clone());

        let result = manager.register().await;
        assert!(matches!(
            result,
            Err(Error::Registration(RegistrationError::ApplicationNotRegistered(_)))
        ));
        assert_eq!(manager.state(), DocumentRegistrationState::Failed);
        assert_eq!(delegate.events(), vec!["started", "failed"]);

        // A failed manager registers from scratch once the precondition holds.
        application.register().await.unwrap();
        let temp = TempDir::new().unwrap();
        let registering = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.register().await })
        };
        wait_until(|| manager.state() == DocumentRegistrationState::PausedAwaitingStructure).await;
        manager.resume_registration(temp.path().to_path_buf()).unwrap();
        registering.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_saves_flow_to_other_clients() {
        let transport = MemoryTransport::new();
        let helper_a = TempDir::new().unwrap();
        let helper_b = TempDir::new().unwrap();

        let app_a = registered_application(Arc::new(transport.clone()), config("c1")).await;
        let delegate_a = RecordingDelegate::answering(Some(helper_a.path().to_path_buf()));
        let writer = shopping_list(&app_a, delegate_a.clone());
        writer.register().await.unwrap();

        let app_b = registered_application(Arc::new(transport.clone()), config("c2")).await;
        let delegate_b = RecordingDelegate::knowing(helper_b.path().to_path_buf());
        let reader = shopping_list(&app_b, delegate_b.clone());
        reader.register().await.unwrap();

        writer.context().save(SaveSet::new().insert(milk())).unwrap();
        wait_until(|| delegate_a.count("save began") == 1).await;
        assert_eq!(writer.cursor().last_written, 1);

        let pulled = reader.pull_remote_changes().await.unwrap();
        assert_eq!(pulled.applied, 1);
        assert_eq!(pulled.origins, 1);
        assert_eq!(reader.context().store().snapshot(), vec![milk()]);
        assert_eq!(delegate_b.count("applied 1"), 1);

        let again = reader.pull_remote_changes().await.unwrap();
        assert_eq!(again.applied, 0);

        let c1 = ClientId::new("c1").unwrap();
        assert_eq!(reader.cursor().applied_for(&c1), 1);
        let persisted = HelperArea::open(helper_b.path()).await.unwrap();
        assert_eq!(persisted.cursor().applied_for(&c1), 1);
    }

    #[tokio::test]
    async fn test_cursor_persisted_after_each_save() {
        let helper = TempDir::new().unwrap();
        let application = registered_application(Arc::new(MemoryTransport::new()), config("c1")).await;
        let delegate = RecordingDelegate::answering(Some(helper.path().to_path_buf()));
        let manager = shopping_list(&application, delegate.clone());
        manager.register().await.unwrap();

        manager.context().save(SaveSet::new().insert(milk())).unwrap();
        manager
            .context()
            .save(SaveSet::new().update(milk().with("qty", json!(2))))
            .unwrap();
        manager
            .context()
            .save(SaveSet::new().update(milk().with("qty", json!(3))))
            .unwrap();
        wait_until(|| delegate.count("save began") == 3).await;

        let persisted = HelperArea::open(helper.path()).await.unwrap();
        assert_eq!(persisted.cursor().last_written, 3);
        assert!(persisted.cursor().last_pull.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_edits_converge() {
        let transport = MemoryTransport::new();
        let helper_a = TempDir::new().unwrap();
        let helper_b = TempDir::new().unwrap();

        let app_a = registered_application(Arc::new(transport.clone()), config("c1")).await;
        let delegate_a = RecordingDelegate::answering(Some(helper_a.path().to_path_buf()));
        let first = shopping_list(&app_a, delegate_a.clone());
        first.register().await.unwrap();

        let app_b = registered_application(Arc::new(transport), config("c2")).await;
        let delegate_b = RecordingDelegate::knowing(helper_b.path().to_path_buf());
        let second = shopping_list(&app_b, delegate_b.clone());
        second.register().await.unwrap();

        // c1 writes three records, c2 overwrites after seeing all of them.
        first.context().save(SaveSet::new().insert(milk())).unwrap();
        for qty in [1, 5] {
            first
                .context()
                .save(SaveSet::new().update(milk().with("qty", json!(qty))))
                .unwrap();
        }
        wait_until(|| delegate_a.count("save began") == 3).await;

        second.pull_remote_changes().await.unwrap();
        second
            .context()
            .save(SaveSet::new().update(milk().with("qty", json!(2))))
            .unwrap();
        wait_until(|| delegate_b.count("save began") == 1).await;

        first.pull_remote_changes().await.unwrap();
        second.pull_remote_changes().await.unwrap();

        let id = ObjectId::new("milk").unwrap();
        let on_first = first.context().store().get(&id).unwrap();
        let on_second = second.context().store().get(&id).unwrap();
        assert_eq!(on_first.attributes["qty"], json!(2));
        assert_eq!(on_first, on_second);
    }

    #[tokio::test]
    async fn test_failed_save_is_reported() {
        let transport = FlakyTransport::default();
        let helper = TempDir::new().unwrap();
        let application = registered_application(Arc::new(transport.clone()), config("c1")).await;
        let delegate = RecordingDelegate::answering(Some(helper.path().to_path_buf()));
        let manager = shopping_list(&application, delegate.clone());
        manager.register().await.unwrap();

        transport.fail_appends.store(true, Ordering::SeqCst);
        manager.context().save(SaveSet::new().insert(milk())).unwrap();
        wait_until(|| delegate.count("save failed") == 1).await;

        transport.fail_appends.store(false, Ordering::SeqCst);
        manager
            .context()
            .did_save(SaveSet::new().update(milk().with("qty", json!(2))))
            .unwrap();
        wait_until(|| delegate.count("save began") == 1).await;

        let log = manager.change_log().unwrap();
        assert_eq!(log.last_written(), 1);
    }

    #[tokio::test]
    async fn test_saves_before_registration_are_queued() {
        let helper = TempDir::new().unwrap();
        let application = registered_application(Arc::new(MemoryTransport::new()), config("c1")).await;
        let delegate = RecordingDelegate::answering(Some(helper.path().to_path_buf()));
        let manager = shopping_list(&application, delegate.clone());

        manager.context().save(SaveSet::new().insert(milk())).unwrap();
        assert!(manager.pull_remote_changes().await.is_err());

        manager.register().await.unwrap();
        wait_until(|| delegate.count("save began") == 1).await;
        assert_eq!(manager.change_log().unwrap().last_written(), 1);
    }

    #[tokio::test]
    async fn test_periodic_mode_pulls_automatically() {
        let transport = MemoryTransport::new();
        let helper_a = TempDir::new().unwrap();

        let app_a = registered_application(Arc::new(transport.clone()), config("c1")).await;
        let writer = shopping_list(
            &app_a,
            RecordingDelegate::answering(Some(helper_a.path().to_path_buf())),
        );
        writer.register().await.unwrap();

        let periodic = config("c2").with_sync_mode(SyncMode::Periodic {
            interval: Duration::from_millis(20),
        });
        let app_b = registered_application(Arc::new(transport), periodic).await;
        let reader = shopping_list(&app_b, RecordingDelegate::answering(None));
        reader.register().await.unwrap();

        writer.context().save(SaveSet::new().insert(milk())).unwrap();
        wait_until(|| !reader.context().store().snapshot().is_empty()).await;

        let scheduler = reader.start_pull_scheduler().unwrap();
        assert!(matches!(scheduler.mode(), SyncMode::Periodic { .. }));
        let result = scheduler.request_pull().await.unwrap();
        assert_eq!(result.applied, 0);
    }
}
