//! Identifier types used throughout docsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Validate an identifier.
///
/// Identifiers double as directory and file names in file-based transports,
/// so they must be non-empty and free of path separators.
fn validate(kind: &str, id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::InvalidInput(format!("{} cannot be empty", kind)));
    }
    if id.contains('/') || id.contains('\\') {
        return Err(crate::Error::InvalidInput(format!(
            "{} cannot contain separators",
            kind
        )));
    }
    if id == "." || id == ".." {
        return Err(crate::Error::InvalidInput(format!(
            "{} cannot be a relative path component",
            kind
        )));
    }
    Ok(())
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier.
            ///
            /// # Errors
            /// - Returns error if the id is empty or contains a path separator
            pub fn new(id: impl Into<String>) -> crate::Result<Self> {
                let id = id.into();
                validate(stringify!($name), &id)?;
                Ok(Self(id))
            }

            /// Get the inner string value.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = crate::Error;

            fn try_from(value: String) -> crate::Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

identifier!(
    /// Identifies an application registered with a sync fabric root.
    ApplicationId
);

identifier!(
    /// Identifies a synchronized document.
    DocumentId
);

identifier!(
    /// Identifies one installation (client device) taking part in sync.
    ClientId
);

identifier!(
    /// Identifies an object inside a document's object graph.
    ObjectId
);

impl ClientId {
    /// Generate a random client identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ObjectId {
    /// Generate a random object identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
