//! Append-only change log for one document stream.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use docsync_common::{ClientId, DocumentId, Error, PendingChange, Result, SyncChange};
use docsync_transport::SyncTransport;

/// Position of the last committed record.
#[derive(Debug, Clone, Copy, Default)]
struct Tip {
    sequence: u64,
    clock: u64,
}

/// The local client's change stream for a document.
///
/// Sequence numbers are assigned under an async mutex, so there is exactly
/// one writer per stream and each save's records get a contiguous range.
/// A failed append consumes no sequence numbers.
pub struct ChangeLog {
    document: DocumentId,
    origin: ClientId,
    transport: Arc<dyn SyncTransport>,
    /// Last committed record; the lock is the single-writer gate.
    writer: Mutex<Tip>,
    /// Mirror of the committed sequence for lock-free reads.
    committed: AtomicU64,
}

impl ChangeLog {
    /// Open the stream, recovering the last written sequence number and clock
    /// from the transport.
    ///
    /// `known_last` is what the caller believes was written (e.g. from a
    /// persisted cursor). The stream itself is authoritative: a hint ahead
    /// of it is logged and ignored.
    pub async fn open(
        document: DocumentId,
        origin: ClientId,
        transport: Arc<dyn SyncTransport>,
        known_last: u64,
    ) -> Result<Self> {
        let written = transport.read_changes_since(&document, &origin, 0).await?;
        let tip = Tip {
            sequence: written.last().map(|r| r.sequence).unwrap_or(0),
            clock: written.iter().map(|r| r.clock).max().unwrap_or(0),
        };

        if known_last > tip.sequence {
            warn!(
                "Stream of {} for {} ends at sequence {}, not {}; continuing from the stream",
                origin, document, tip.sequence, known_last
            );
        } else if tip.sequence != known_last {
            debug!(
                "Recovered {} record(s) for {} written after sequence {}",
                tip.sequence - known_last,
                document,
                known_last
            );
        }

        Ok(Self {
            document,
            origin,
            transport,
            writer: Mutex::new(tip),
            committed: AtomicU64::new(tip.sequence),
        })
    }

    /// Document this log belongs to.
    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    /// Client whose stream this is.
    pub fn origin(&self) -> &ClientId {
        &self.origin
    }

    /// Last successfully appended sequence number (0 when empty).
    pub fn last_written(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Assign sequence numbers and clocks to one save's changes and append
    /// them as a single batch.
    ///
    /// Clocks continue after both this stream and `observed_clock`, the
    /// highest clock the caller has seen from any client.
    ///
    /// # Errors
    /// - [`Error::SaveProcessing`] if the transport rejects the batch; no
    ///   record of the save is committed and no sequence number is used
    pub async fn append_save(
        &self,
        changes: Vec<PendingChange>,
        observed_clock: u64,
    ) -> Result<Vec<SyncChange>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let mut tip = self.writer.lock().await;
        let created_at = Utc::now();
        let base_clock = tip.clock.max(observed_clock);
        let records: Vec<SyncChange> = changes
            .into_iter()
            .enumerate()
            .map(|(offset, change)| {
                let offset = offset as u64;
                SyncChange::from_pending(
                    change,
                    self.document.clone(),
                    tip.sequence + 1 + offset,
                    base_clock + 1 + offset,
                    self.origin.clone(),
                    created_at,
                )
            })
            .collect();

        if let Err(e) = self.transport.append_changes(&self.document, &records).await {
            warn!("Append to {} failed, discarding save: {}", self.document, e);
            return Err(Error::SaveProcessing(format!(
                "append to {} failed: {}",
                self.document, e
            )));
        }

        tip.sequence += records.len() as u64;
        tip.clock = base_clock + records.len() as u64;
        self.committed.store(tip.sequence, Ordering::SeqCst);

        debug!(
            "Committed {} record(s) to {} up to sequence {} (clock {})",
            records.len(),
            self.document,
            tip.sequence,
            tip.clock
        );
        Ok(records)
    }

    /// Clock of the last committed record (0 when empty).
    pub async fn last_clock(&self) -> u64 {
        self.writer.lock().await.clock
    }

    /// Records of `origin` after `since`, in sequence order.
    ///
    /// Only fully committed batches are visible.
    pub async fn read_since(&self, origin: &ClientId, since: u64) -> Result<Vec<SyncChange>> {
        self.transport
            .read_changes_since(&self.document, origin, since)
            .await
    }
}
