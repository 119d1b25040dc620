//! The caller-supplied helper location.
//!
//! First-time document registration stages the document description here
//! before the remote structure is created. Afterwards the area holds the
//! document's pull cursor so a restart does not re-apply remote changes.

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use docsync_common::{Error, Result};
use docsync_transport::DocumentInfo;

use crate::cursor::SyncCursor;

/// Staged document description awaiting remote creation.
pub const STAGED_DOCUMENT_FILENAME: &str = "staged-document.json";
/// Document description after the remote structure exists.
pub const DOCUMENT_FILENAME: &str = "document.json";
/// Persisted pull cursor.
pub const CURSOR_FILENAME: &str = "cursor.json";

/// Local scratch directory of one document.
pub struct HelperArea {
    base_dir: PathBuf,
    cursor: SyncCursor,
}

impl HelperArea {
    /// Open the helper area, creating the directory if needed.
    ///
    /// # Errors
    /// - The directory cannot be created
    /// - An existing cursor file cannot be read or parsed
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let cursor_path = base_dir.join(CURSOR_FILENAME);
        let cursor = if fs::try_exists(&cursor_path).await? {
            let content = fs::read_to_string(&cursor_path).await?;
            SyncCursor::from_json(&content)?
        } else {
            SyncCursor::new()
        };

        debug!("Opened helper area at {}", base_dir.display());
        Ok(Self { base_dir, cursor })
    }

    /// Directory backing this area.
    pub fn path(&self) -> &Path {
        &self.base_dir
    }

    /// Stage the description of a document about to be created remotely.
    pub async fn stage_document(&self, info: &DocumentInfo) -> Result<()> {
        let json = serde_json::to_string_pretty(info)?;
        fs::write(self.base_dir.join(STAGED_DOCUMENT_FILENAME), json).await?;
        Ok(())
    }

    /// The staged description, if any.
    pub async fn staged_document(&self) -> Result<Option<DocumentInfo>> {
        let path = self.base_dir.join(STAGED_DOCUMENT_FILENAME);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Promote the staged description once the remote structure exists.
    ///
    /// # Errors
    /// - [`Error::NotFound`] if nothing is staged
    pub async fn commit_staged(&self) -> Result<()> {
        let staged = self.base_dir.join(STAGED_DOCUMENT_FILENAME);
        if !fs::try_exists(&staged).await? {
            return Err(Error::NotFound("No staged document to commit".to_string()));
        }
        fs::rename(&staged, self.base_dir.join(DOCUMENT_FILENAME)).await?;
        Ok(())
    }

    /// Drop the staged description. Missing files are ignored.
    pub async fn discard_staged(&self) -> Result<()> {
        match fs::remove_file(self.base_dir.join(STAGED_DOCUMENT_FILENAME)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Cursor as loaded or last persisted.
    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Write the cursor to disk.
    pub async fn persist_cursor(&mut self, cursor: &SyncCursor) -> Result<()> {
        let json = cursor.to_json()?;
        let path = self.base_dir.join(CURSOR_FILENAME);
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, json).await?;
        fs::rename(&temp, &path).await?;
        self.cursor = cursor.clone();
        Ok(())
    }
}
