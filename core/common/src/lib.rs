//! Common utilities and types shared across docsync modules.
//!
//! This module provides the error taxonomy, the identifier newtypes and the
//! `SyncChange` record that every other crate exchanges.

pub mod change;
pub mod error;
pub mod types;

pub use change::{Attributes, ChangeKind, ChangeStamp, PendingChange, SyncChange};
pub use error::{Error, RegistrationError, Result};
pub use types::{ApplicationId, ClientId, DocumentId, ObjectId};
