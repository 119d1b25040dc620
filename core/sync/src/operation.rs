//! Cancellable, single-use units of asynchronous work.
//!
//! An [`Operation`] wraps an [`OperationTask`] in a fixed state machine:
//! `Pending → Running → {Completed, Cancelled, Failed}`. Exactly one of the
//! three [`OperationDelegate`] callbacks fires, exactly once. Operations never
//! retry; a failure is reported once and retrying is the caller's call.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use docsync_common::{Error, Result};

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Created, not yet started.
    Pending,
    /// Work in progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Stopped on request.
    Cancelled,
    /// Stopped by an error.
    Failed,
}

impl OperationState {
    /// Terminal states permit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Cancelled | OperationState::Failed
        )
    }
}

/// How an operation ended.
#[derive(Debug)]
pub enum OperationOutcome {
    Completed,
    Cancelled,
    Failed(Error),
}

impl OperationOutcome {
    /// The terminal state matching this outcome.
    pub fn state(&self) -> OperationState {
        match self {
            OperationOutcome::Completed => OperationState::Completed,
            OperationOutcome::Cancelled => OperationState::Cancelled,
            OperationOutcome::Failed(_) => OperationState::Failed,
        }
    }

    /// Convert into a result; cancellation maps to [`Error::Cancelled`].
    pub fn into_result(self) -> Result<()> {
        match self {
            OperationOutcome::Completed => Ok(()),
            OperationOutcome::Cancelled => Err(Error::Cancelled),
            OperationOutcome::Failed(e) => Err(e),
        }
    }
}

/// Receiver of operation completion callbacks.
///
/// All three members are required.
pub trait OperationDelegate: Send + Sync {
    fn operation_completed_successfully(&self, operation: Uuid);
    fn operation_was_cancelled(&self, operation: Uuid);
    fn operation_failed_to_complete(&self, operation: Uuid, error: &Error);
}

/// Cancellation view handed to a running task.
///
/// Tasks call [`Checkpoint::check`] between atomic sub-steps and race
/// [`Checkpoint::cancelled`] against any wait that may block indefinitely.
#[derive(Clone)]
pub struct Checkpoint {
    token: CancellationToken,
}

impl Checkpoint {
    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Return [`Error::Cancelled`] if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// The work an operation performs.
#[async_trait]
pub trait OperationTask: Send + Sync + 'static {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Perform the work.
    ///
    /// Returning [`Error::Cancelled`] ends the operation as cancelled rather
    /// than failed. A task that creates remote structure must undo it before
    /// returning `Cancelled`.
    async fn run(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// A single-use, cancellable unit of asynchronous work.
pub struct Operation<T: OperationTask> {
    id: Uuid,
    task: T,
    state: Mutex<OperationState>,
    token: CancellationToken,
    delegate: Option<Weak<dyn OperationDelegate>>,
}

impl<T: OperationTask> Operation<T> {
    /// Create a pending operation.
    pub fn new(task: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            task,
            state: Mutex::new(OperationState::Pending),
            token: CancellationToken::new(),
            delegate: None,
        }
    }

    /// Attach a delegate. The operation never keeps it alive.
    pub fn with_delegate(mut self, delegate: Weak<dyn OperationDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Unique identifier of this operation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> OperationState {
        *self.state.lock()
    }

    /// The wrapped task.
    pub fn task(&self) -> &T {
        &self.task
    }

    /// Move from pending to running and spawn the work.
    ///
    /// A task that panics fails the operation.
    ///
    /// # Errors
    /// - The operation is not pending (already started, finished or cancelled)
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<OperationOutcome>> {
        {
            let mut state = self.state.lock();
            if *state != OperationState::Pending {
                return Err(Error::InvalidState(format!(
                    "{} operation {} cannot start from {:?}",
                    self.task.name(),
                    self.id,
                    *state
                )));
            }
            *state = OperationState::Running;
        }

        debug!("Starting {} operation {}", self.task.name(), self.id);

        let operation = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let checkpoint = Checkpoint {
                token: operation.token.clone(),
            };
            let result = AssertUnwindSafe(operation.task.run(&checkpoint))
                .catch_unwind()
                .await;
            let outcome = match result {
                Ok(Ok(())) => OperationOutcome::Completed,
                Ok(Err(e)) if e.is_cancellation() => OperationOutcome::Cancelled,
                Ok(Err(e)) => OperationOutcome::Failed(e),
                Err(panic) => OperationOutcome::Failed(Error::InvalidState(format!(
                    "{} operation panicked: {}",
                    operation.task.name(),
                    panic_message(panic.as_ref())
                ))),
            };
            operation.finish(outcome)
        }))
    }

    /// Start the operation and wait for its outcome.
    pub async fn run(self: &Arc<Self>) -> Result<OperationOutcome> {
        let handle = self.start()?;
        handle
            .await
            .map_err(|e| Error::InvalidState(format!("operation task aborted: {}", e)))
    }

    /// Request cancellation.
    ///
    /// A pending operation is cancelled on the spot and never runs. A running
    /// operation stops at its next checkpoint. Finished operations ignore the
    /// request.
    pub fn cancel(&self) {
        let cancelled_while_pending = {
            let mut state = self.state.lock();
            match *state {
                OperationState::Pending => {
                    *state = OperationState::Cancelled;
                    true
                }
                OperationState::Running => false,
                _ => return,
            }
        };

        self.token.cancel();

        if cancelled_while_pending {
            debug!("{} operation {} cancelled before start", self.task.name(), self.id);
            self.notify(&OperationOutcome::Cancelled);
        } else {
            debug!("Cancellation requested for {} operation {}", self.task.name(), self.id);
        }
    }

    fn finish(&self, outcome: OperationOutcome) -> OperationOutcome {
        *self.state.lock() = outcome.state();

        match &outcome {
            OperationOutcome::Completed => {
                debug!("{} operation {} completed", self.task.name(), self.id)
            }
            OperationOutcome::Cancelled => {
                debug!("{} operation {} cancelled", self.task.name(), self.id)
            }
            OperationOutcome::Failed(e) => {
                warn!("{} operation {} failed: {}", self.task.name(), self.id, e)
            }
        }

        self.notify(&outcome);
        outcome
    }

    fn notify(&self, outcome: &OperationOutcome) {
        let Some(delegate) = self.delegate.as_ref().and_then(Weak::upgrade) else {
            return;
        };

        match outcome {
            OperationOutcome::Completed => delegate.operation_completed_successfully(self.id),
            OperationOutcome::Cancelled => delegate.operation_was_cancelled(self.id),
            OperationOutcome::Failed(e) => delegate.operation_failed_to_complete(self.id, e),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
