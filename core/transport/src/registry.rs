//! Opening transports from configuration.
//!
//! A host names its sync fabric with [`TransportSettings`]: a backend kind
//! plus backend options, usually read from the client configuration. The
//! [`TransportRegistry`] turns settings into a live [`SyncTransport`].

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::file::FileTransport;
use crate::memory::MemoryTransport;
use crate::transport::SyncTransport;
use docsync_common::{Error, Result};

/// Builds a transport from the options of its settings.
pub type TransportFactory = Box<dyn Fn(&Value) -> Result<Arc<dyn SyncTransport>> + Send + Sync>;

/// Which fabric to sync through.
///
/// ```json
/// { "kind": "file", "options": { "root": "/shared/docsync", "create": true } }
/// { "kind": "memory", "options": { "fabric": "tests" } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl TransportSettings {
    /// A private in-memory fabric.
    pub fn memory() -> Self {
        Self {
            kind: "memory".to_string(),
            options: Value::Null,
        }
    }

    /// An in-memory fabric shared by every transport opened with the same name
    /// from one registry.
    pub fn shared_memory(fabric: impl Into<String>) -> Self {
        Self {
            kind: "memory".to_string(),
            options: serde_json::json!({ "fabric": fabric.into() }),
        }
    }

    /// A filesystem fabric rooted at an existing directory.
    pub fn file(root: impl AsRef<Path>) -> Self {
        Self {
            kind: "file".to_string(),
            options: serde_json::json!({ "root": root.as_ref() }),
        }
    }

    /// Like [`Self::file`], creating the root directory if it is missing.
    pub fn file_creating(root: impl AsRef<Path>) -> Self {
        Self {
            kind: "file".to_string(),
            options: serde_json::json!({ "root": root.as_ref(), "create": true }),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::memory()
    }
}

#[derive(Deserialize)]
struct FileOptions {
    root: PathBuf,
    #[serde(default)]
    create: bool,
}

#[derive(Default, Deserialize)]
struct MemoryOptions {
    fabric: Option<String>,
}

fn options<T: serde::de::DeserializeOwned>(kind: &str, options: &Value) -> Result<T> {
    serde_json::from_value(options.clone())
        .map_err(|e| Error::InvalidInput(format!("Invalid '{}' transport options: {}", kind, e)))
}

/// Open a file fabric, checking that the root can hold one.
fn open_file(value: &Value) -> Result<Arc<dyn SyncTransport>> {
    let FileOptions { root, create } = options("file", value)?;
    if root.as_os_str().is_empty() {
        return Err(Error::InvalidInput("File transport root is empty".to_string()));
    }

    match std::fs::metadata(&root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(Error::InvalidInput(format!(
                "File transport root is not a directory: {}",
                root.display()
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {
            std::fs::create_dir_all(&root)?;
            debug!("Created file transport root {}", root.display());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!(
                "File transport root does not exist: {}",
                root.display()
            )))
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Arc::new(FileTransport::new(root)))
}

/// Backend kinds a host can open.
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// Create a registry without any backend.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Add a backend kind.
    ///
    /// # Errors
    /// - [`Error::AlreadyExists`] if the kind is taken
    pub fn register(&mut self, kind: impl Into<String>, factory: TransportFactory) -> Result<()> {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Transport kind '{}' is already registered",
                kind
            )));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Open the fabric described by `settings`.
    ///
    /// # Errors
    /// - [`Error::NotFound`] for an unknown kind or a missing file root
    /// - [`Error::InvalidInput`] if the options do not fit the kind
    pub fn open(&self, settings: &TransportSettings) -> Result<Arc<dyn SyncTransport>> {
        let factory = self.factories.get(&settings.kind).ok_or_else(|| {
            Error::NotFound(format!("Transport kind '{}' is not registered", settings.kind))
        })?;
        factory(&settings.options)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the `file` and `memory` backends.
///
/// Named memory fabrics live as long as the registry.
pub fn create_default_registry() -> TransportRegistry {
    let mut factories: HashMap<String, TransportFactory> = HashMap::new();

    let fabrics: Arc<Mutex<HashMap<String, MemoryTransport>>> = Arc::default();
    factories.insert(
        "memory".to_string(),
        Box::new(move |value| {
            let MemoryOptions { fabric } = if value.is_null() {
                MemoryOptions::default()
            } else {
                options("memory", value)?
            };
            let transport = match fabric {
                Some(name) => fabrics.lock().entry(name).or_default().clone(),
                None => MemoryTransport::new(),
            };
            Ok(Arc::new(transport) as Arc<dyn SyncTransport>)
        }),
    );
    factories.insert("file".to_string(), Box::new(open_file));

    TransportRegistry { factories }
}
