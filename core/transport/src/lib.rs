//! Transport abstraction for docsync.
//!
//! This module provides the structural contract the sync core consumes
//! (root exists / create root / document structure exists / create document /
//! append changes / read changes since a sequence number), a filesystem
//! backend, an in-memory backend, and a registry for resolving backends by
//! name.
//!
//! # Design Principles
//! - Transport isolation: no medium-specific logic in the sync core
//! - Async operations: all I/O operations are async
//! - Atomic batches: a reader never observes half of an append
//! - No hidden retries: every failure is reported exactly once

pub mod file;
pub mod memory;
pub mod registry;
pub mod transport;

pub use file::FileTransport;
pub use memory::MemoryTransport;
pub use registry::{create_default_registry, TransportFactory, TransportRegistry, TransportSettings};
pub use transport::{ClientInfo, DocumentInfo, FormatVersion, RootMarker, SyncTransport};
