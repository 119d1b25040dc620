//! DocSync core
//!
//! Registers an application and its documents against a shared transport and
//! turns local saves into per-client change streams:
//! - Cancellable registration operations with compensating cleanup
//! - A pause when a document's remote structure does not exist yet
//! - Contiguous, atomically appended change logs
//! - Deterministic replay with last-writer-wins conflict resolution
//! - On-demand and periodic pulls of other clients' streams

pub mod application;
pub mod config;
pub mod conflict;
pub mod context;
pub mod cursor;
pub mod document;
pub mod helper;
pub mod log;
pub mod operation;
pub mod registration;
pub mod scheduler;

#[cfg(test)]
mod testing;

// Re-export main types
pub use application::{
    ApplicationRegistrationState, ApplicationSyncManager, ApplicationSyncManagerDelegate,
    NoopApplicationDelegate,
};
pub use config::SyncConfig;
pub use conflict::{
    ConflictResolver, ConflictStrategy, ObjectStamps, Resolution, StrategyResolver,
};
pub use context::{
    ApplyOutcome, MemoryObjectStore, ObjectStore, SaveSet, SynchronizedObject,
    SynchronizedObjectContext,
};
pub use cursor::SyncCursor;
pub use document::{DocumentRegistrationState, DocumentSyncManager, DocumentSyncManagerDelegate};
pub use helper::HelperArea;
pub use log::ChangeLog;
pub use operation::{
    Checkpoint, Operation, OperationDelegate, OperationOutcome, OperationState, OperationTask,
};
pub use registration::{
    ApplicationRegistrationOperation, DocumentRegistrationOperation, RegistrationEvent,
    RegistrationEvents,
};
pub use scheduler::{PullRequest, PullResult, PullScheduler, PullSchedulerHandle, SyncMode};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _config = SyncConfig::default();
        let _cursor = SyncCursor::new();
        let _store = MemoryObjectStore::new();
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::LastWriterWins);
        assert_eq!(SyncMode::default(), SyncMode::Manual);
    }
}
