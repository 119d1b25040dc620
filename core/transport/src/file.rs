//! Filesystem sync transport.
//!
//! Stores the remote structure as plain files below a root directory, which
//! makes any shared or synced folder usable as a sync fabric:
//!
//! ```text
//! docsync.json                                   root marker
//! clients/<client>.json                          client records
//! documents/<doc>/document.json                  document info
//! documents/<doc>/changes/<origin>/<first>-<last>.json   one batch per save
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::transport::{
    check_continuation, validate_batch, ClientInfo, DocumentInfo, RootMarker, SyncTransport,
};
use docsync_common::{ClientId, DocumentId, Error, Result, SyncChange};

/// Root marker file name.
pub const ROOT_MARKER_FILENAME: &str = "docsync.json";

/// Directory holding client records.
pub const CLIENTS_DIRNAME: &str = "clients";

/// Directory holding per-document structures.
pub const DOCUMENTS_DIRNAME: &str = "documents";

/// Document info file name inside a document directory.
pub const DOCUMENT_INFO_FILENAME: &str = "document.json";

/// Directory holding change streams inside a document directory.
pub const CHANGES_DIRNAME: &str = "changes";

const BATCH_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Filesystem transport.
pub struct FileTransport {
    root: PathBuf,
}

impl FileTransport {
    /// Create a transport rooted at the given directory.
    ///
    /// Nothing is touched on disk until the root is created.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory of the fabric.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(ROOT_MARKER_FILENAME)
    }

    fn client_path(&self, client: &ClientId) -> PathBuf {
        self.root
            .join(CLIENTS_DIRNAME)
            .join(format!("{}.{}", client, BATCH_EXTENSION))
    }

    fn document_dir(&self, document: &DocumentId) -> PathBuf {
        self.root.join(DOCUMENTS_DIRNAME).join(document.as_str())
    }

    fn stream_dir(&self, document: &DocumentId, origin: &ClientId) -> PathBuf {
        self.document_dir(document)
            .join(CHANGES_DIRNAME)
            .join(origin.as_str())
    }

    fn batch_file_name(first: u64, last: u64) -> String {
        format!("{:020}-{:020}.{}", first, last, BATCH_EXTENSION)
    }

    /// Parse `<first>-<last>.json` into its sequence range.
    fn parse_batch_file_name(name: &str) -> Option<(u64, u64)> {
        let stem = name.strip_suffix(&format!(".{}", BATCH_EXTENSION))?;
        let (first, last) = stem.split_once('-')?;
        Some((first.parse().ok()?, last.parse().ok()?))
    }

    /// Highest sequence number among the committed batches of a stream.
    async fn stream_tip(dir: &Path) -> Result<u64> {
        let mut tip = 0;
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some((_, last)) = entry.file_name().to_str().and_then(Self::parse_batch_file_name) {
                tip = tip.max(last);
            }
        }
        Ok(tip)
    }

    async fn ensure_root(&self) -> Result<()> {
        if !fs::try_exists(self.marker_path()).await? {
            return Err(Error::NotFound(format!(
                "Sync root not found: {}",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn ensure_document(&self, document: &DocumentId) -> Result<()> {
        let info_path = self.document_dir(document).join(DOCUMENT_INFO_FILENAME);
        if !fs::try_exists(&info_path).await? {
            return Err(Error::NotFound(format!("Document not found: {}", document)));
        }
        Ok(())
    }

    /// Write a file so readers either see the old state or the whole new file.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension(TEMP_EXTENSION);
        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        Self::write_atomic(path, &bytes).await
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl SyncTransport for FileTransport {
    fn name(&self) -> &str {
        "file"
    }

    async fn root_exists(&self) -> Result<bool> {
        Ok(fs::try_exists(self.marker_path()).await?)
    }

    async fn create_root(&self, marker: &RootMarker) -> Result<()> {
        if self.root_exists().await? {
            return Err(Error::AlreadyExists(format!(
                "Sync root already exists: {}",
                self.root.display()
            )));
        }

        fs::create_dir_all(self.root.join(CLIENTS_DIRNAME)).await?;
        fs::create_dir_all(self.root.join(DOCUMENTS_DIRNAME)).await?;
        // The marker goes last: a root without it does not count as created.
        Self::write_json(&self.marker_path(), marker).await?;

        debug!("Created sync root at {}", self.root.display());
        Ok(())
    }

    async fn read_root(&self) -> Result<RootMarker> {
        self.ensure_root().await?;
        Self::read_json(&self.marker_path()).await
    }

    async fn remove_root(&self) -> Result<()> {
        let marker = self.marker_path();
        if fs::try_exists(&marker).await? {
            fs::remove_file(&marker).await?;
        }
        for dir in [CLIENTS_DIRNAME, DOCUMENTS_DIRNAME] {
            let path = self.root.join(dir);
            if fs::try_exists(&path).await? {
                fs::remove_dir_all(&path).await?;
            }
        }

        debug!("Removed sync root at {}", self.root.display());
        Ok(())
    }

    async fn register_client(&self, client: &ClientInfo) -> Result<()> {
        self.ensure_root().await?;
        fs::create_dir_all(self.root.join(CLIENTS_DIRNAME)).await?;
        Self::write_json(&self.client_path(&client.client), client).await
    }

    async fn document_exists(&self, document: &DocumentId) -> Result<bool> {
        let info_path = self.document_dir(document).join(DOCUMENT_INFO_FILENAME);
        Ok(fs::try_exists(&info_path).await?)
    }

    async fn create_document(&self, info: &DocumentInfo) -> Result<()> {
        self.ensure_root().await?;

        if self.document_exists(&info.document).await? {
            return Err(Error::AlreadyExists(format!(
                "Document already exists: {}",
                info.document
            )));
        }

        let dir = self.document_dir(&info.document);
        fs::create_dir_all(dir.join(CHANGES_DIRNAME)).await?;
        Self::write_json(&dir.join(DOCUMENT_INFO_FILENAME), info).await?;

        debug!("Created document structure at {}", dir.display());
        Ok(())
    }

    async fn read_document(&self, document: &DocumentId) -> Result<DocumentInfo> {
        self.ensure_document(document).await?;
        Self::read_json(&self.document_dir(document).join(DOCUMENT_INFO_FILENAME)).await
    }

    async fn remove_document(&self, document: &DocumentId) -> Result<()> {
        let dir = self.document_dir(document);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn append_changes(&self, document: &DocumentId, records: &[SyncChange]) -> Result<()> {
        validate_batch(document, records)?;
        self.ensure_document(document).await?;

        // validate_batch guarantees a non-empty, contiguous batch.
        let first = records[0].sequence;
        let last = first + records.len() as u64 - 1;
        let dir = self.stream_dir(document, &records[0].origin);
        fs::create_dir_all(&dir).await?;

        let tip = Self::stream_tip(&dir).await?;
        check_continuation(&records[0].origin, tip, first)?;

        let path = dir.join(Self::batch_file_name(first, last));
        if fs::try_exists(&path).await? {
            return Err(Error::AlreadyExists(format!(
                "Sequence {} already written for {}",
                first, records[0].origin
            )));
        }

        Self::write_json(&path, &records).await?;

        debug!(
            "Appended {} change(s) [{}..={}] to {}",
            records.len(),
            first,
            last,
            document
        );
        Ok(())
    }

    async fn read_changes_since(
        &self,
        document: &DocumentId,
        origin: &ClientId,
        since: u64,
    ) -> Result<Vec<SyncChange>> {
        self.ensure_document(document).await?;

        let dir = self.stream_dir(document, origin);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut batches = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some((first, last)) = name.to_str().and_then(Self::parse_batch_file_name) else {
                continue;
            };
            if last > since {
                batches.push((first, entry.path()));
            }
        }
        batches.sort_by_key(|(first, _)| *first);

        let mut records = Vec::new();
        for (_, path) in batches {
            let batch: Vec<SyncChange> = Self::read_json(&path).await?;
            records.extend(batch.into_iter().filter(|r| r.sequence > since));
        }

        Ok(records)
    }

    async fn change_origins(&self, document: &DocumentId) -> Result<Vec<ClientId>> {
        self.ensure_document(document).await?;

        let dir = self.document_dir(document).join(CHANGES_DIRNAME);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut origins = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                origins.push(ClientId::new(name)?);
            }
        }
        origins.sort();

        Ok(origins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docsync_common::{ApplicationId, ObjectId, PendingChange};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn doc_info(doc: &str) -> DocumentInfo {
        DocumentInfo {
            document: DocumentId::new(doc).unwrap(),
            description: "Shopping List".to_string(),
            metadata: BTreeMap::new(),
            created_by: ClientId::new("c1").unwrap(),
            created_at: Utc::now(),
        }
    }

    fn batch(doc: &str, origin: &str, first: u64, count: u64) -> Vec<SyncChange> {
        (first..first + count)
            .map(|seq| {
                SyncChange::from_pending(
                    PendingChange::insert(
                        ObjectId::new(format!("o{}", seq)).unwrap(),
                        "Item",
                        BTreeMap::new(),
                    ),
                    DocumentId::new(doc).unwrap(),
                    seq,
                    seq,
                    ClientId::new(origin).unwrap(),
                    Utc::now(),
                )
            })
            .collect()
    }

    async fn transport_with_document(temp: &TempDir) -> FileTransport {
        let transport = FileTransport::new(temp.path().join("root"));
        transport
            .create_root(&RootMarker::new(ApplicationId::new("app-1").unwrap()))
            .await
            .unwrap();
        transport.create_document(&doc_info("doc-1")).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_file_root_lifecycle() {
        let temp = TempDir::new().unwrap();
        let transport = FileTransport::new(temp.path().join("root"));
        assert!(!transport.root_exists().await.unwrap());

        let marker = RootMarker::new(ApplicationId::new("app-1").unwrap());
        transport.create_root(&marker).await.unwrap();
        assert!(transport.root_exists().await.unwrap());
        assert_eq!(transport.read_root().await.unwrap(), marker);

        assert!(matches!(
            transport.create_root(&marker).await,
            Err(Error::AlreadyExists(_))
        ));

        transport.remove_root().await.unwrap();
        assert!(!transport.root_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_file_document_requires_root() {
        let temp = TempDir::new().unwrap();
        let transport = FileTransport::new(temp.path());

        let result = transport.create_document(&doc_info("doc-1")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_file_append_and_read() {
        let temp = TempDir::new().unwrap();
        let transport = transport_with_document(&temp).await;
        let doc = DocumentId::new("doc-1").unwrap();
        let origin = ClientId::new("c1").unwrap();

        transport.append_changes(&doc, &batch("doc-1", "c1", 1, 2)).await.unwrap();
        transport.append_changes(&doc, &batch("doc-1", "c1", 3, 3)).await.unwrap();

        let all = transport.read_changes_since(&doc, &origin, 0).await.unwrap();
        let sequences: Vec<u64> = all.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

        let tail = transport.read_changes_since(&doc, &origin, 3).await.unwrap();
        let sequences: Vec<u64> = tail.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_file_rejects_sequence_reuse() {
        let temp = TempDir::new().unwrap();
        let transport = transport_with_document(&temp).await;
        let doc = DocumentId::new("doc-1").unwrap();

        transport.append_changes(&doc, &batch("doc-1", "c1", 1, 1)).await.unwrap();
        let result = transport.append_changes(&doc, &batch("doc-1", "c1", 1, 1)).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_file_rejects_overlapping_and_gapped_batches() {
        let temp = TempDir::new().unwrap();
        let transport = transport_with_document(&temp).await;
        let doc = DocumentId::new("doc-1").unwrap();
        let origin = ClientId::new("c1").unwrap();

        transport.append_changes(&doc, &batch("doc-1", "c1", 1, 2)).await.unwrap();

        let overlapping = transport.append_changes(&doc, &batch("doc-1", "c1", 2, 2)).await;
        assert!(matches!(overlapping, Err(Error::AlreadyExists(_))));

        let gapped = transport.append_changes(&doc, &batch("doc-1", "c1", 10, 1)).await;
        assert!(matches!(gapped, Err(Error::InvalidInput(_))));

        transport.append_changes(&doc, &batch("doc-1", "c1", 3, 1)).await.unwrap();
        let sequences: Vec<u64> = transport
            .read_changes_since(&doc, &origin, 0)
            .await
            .unwrap()
            .iter()
            .map(|r| r.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_file_ignores_partial_batches() {
        let temp = TempDir::new().unwrap();
        let transport = transport_with_document(&temp).await;
        let doc = DocumentId::new("doc-1").unwrap();
        let origin = ClientId::new("c1").unwrap();

        transport.append_changes(&doc, &batch("doc-1", "c1", 1, 1)).await.unwrap();

        // A writer that died mid-write leaves only a temp file behind.
        let stream = transport.stream_dir(&doc, &origin);
        std::fs::write(stream.join("00000000000000000002-00000000000000000002.tmp"), b"{").unwrap();

        let records = transport.read_changes_since(&doc, &origin, 0).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_file_change_origins() {
        let temp = TempDir::new().unwrap();
        let transport = transport_with_document(&temp).await;
        let doc = DocumentId::new("doc-1").unwrap();

        assert!(transport.change_origins(&doc).await.unwrap().is_empty());

        transport.append_changes(&doc, &batch("doc-1", "c2", 1, 1)).await.unwrap();
        transport.append_changes(&doc, &batch("doc-1", "c1", 1, 1)).await.unwrap();

        let origins = transport.change_origins(&doc).await.unwrap();
        assert_eq!(
            origins,
            vec![ClientId::new("c1").unwrap(), ClientId::new("c2").unwrap()]
        );
    }

    #[tokio::test]
    async fn test_file_register_client() {
        let temp = TempDir::new().unwrap();
        let transport = transport_with_document(&temp).await;
        let client = ClientInfo {
            client: ClientId::new("c1").unwrap(),
            description: "laptop".to_string(),
            registered_at: Utc::now(),
        };

        transport.register_client(&client).await.unwrap();
        transport.register_client(&client).await.unwrap();
        assert!(transport.client_path(&client.client).exists());
    }

    #[test]
    fn test_batch_file_names() {
        let name = FileTransport::batch_file_name(7, 9);
        assert_eq!(FileTransport::parse_batch_file_name(&name), Some((7, 9)));
        assert_eq!(FileTransport::parse_batch_file_name("junk.json"), None);
        assert_eq!(FileTransport::parse_batch_file_name("1-2.tmp"), None);
    }
}
