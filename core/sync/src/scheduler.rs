//! Pull scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use docsync_common::{Error, Result};

/// When remote changes are pulled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only when the host asks.
    #[default]
    Manual,
    /// On request and at a fixed interval.
    Periodic {
        #[serde(with = "duration_secs")]
        interval: Duration,
    },
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Requests accepted by the scheduler loop.
#[derive(Debug)]
pub enum PullRequest {
    /// Pull now.
    Pull,
    /// Stop the loop.
    Shutdown,
}

/// Summary of one pull.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullResult {
    /// Records that changed the local store.
    pub applied: usize,
    /// Remote origins consulted.
    pub origins: usize,
    pub duration: Duration,
}

type Request = (PullRequest, oneshot::Sender<Result<PullResult>>);

/// Front end for requesting pulls from a running [`PullSchedulerHandle`].
#[derive(Clone)]
pub struct PullScheduler {
    mode: SyncMode,
    request_tx: mpsc::Sender<Request>,
}

impl PullScheduler {
    /// Create a scheduler and the handle that runs its loop.
    pub fn new(mode: SyncMode) -> (Self, PullSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let scheduler = Self { mode, request_tx };
        let handle = PullSchedulerHandle { mode, request_rx };
        (scheduler, handle)
    }

    /// Mode the loop was started with.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Request a pull and wait for its result.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] if the loop is not running
    /// - Whatever the pull itself returns
    pub async fn request_pull(&self) -> Result<PullResult> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((PullRequest::Pull, response_tx))
            .await
            .map_err(|_| Error::InvalidState("Pull scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidState("Pull scheduler dropped the request".to_string()))?
    }

    /// Stop the loop. Pending requests are dropped.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((PullRequest::Shutdown, response_tx))
            .await;
    }
}

/// The scheduler loop; spawn [`PullSchedulerHandle::run`] on a task.
pub struct PullSchedulerHandle {
    mode: SyncMode,
    request_rx: mpsc::Receiver<Request>,
}

impl PullSchedulerHandle {
    /// Run until shutdown or until every [`PullScheduler`] is dropped.
    ///
    /// `pull_fn` is called once per request and once per periodic tick.
    pub async fn run<F, Fut>(mut self, pull_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<PullResult>> + Send,
    {
        let mut ticker = match self.mode {
            SyncMode::Periodic { interval: period } => {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;
                Some(ticker)
            }
            SyncMode::Manual => None,
        };

        info!("Pull scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                request = self.request_rx.recv() => match request {
                    Some((PullRequest::Pull, response_tx)) => {
                        debug!("Processing pull request");
                        let _ = response_tx.send(pull_fn().await);
                    }
                    Some((PullRequest::Shutdown, _)) | None => {
                        info!("Pull scheduler shutting down");
                        break;
                    }
                },
                _ = Self::next_tick(&mut ticker) => {
                    debug!("Triggering periodic pull");
                    match pull_fn().await {
                        Ok(result) => debug!(
                            "Periodic pull applied {} record(s) from {} origin(s)",
                            result.applied, result.origins
                        ),
                        Err(e) => error!("Periodic pull failed: {}", e),
                    }
                }
            }
        }
    }

    async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}
