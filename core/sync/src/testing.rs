//! Test doubles shared by the unit tests of this crate.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docsync_common::{ApplicationId, ClientId, DocumentId, Error, Result, SyncChange};
use docsync_transport::{ClientInfo, DocumentInfo, MemoryTransport, RootMarker, SyncTransport};

/// Memory transport that can fail appends or slow down chosen calls.
#[derive(Clone, Default)]
pub(crate) struct FlakyTransport {
    pub inner: MemoryTransport,
    pub fail_appends: Arc<AtomicBool>,
    pub append_delay: Option<Duration>,
    pub root_delay: Option<Duration>,
}

#[async_trait]
impl SyncTransport for FlakyTransport {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn root_exists(&self) -> Result<bool> {
        if let Some(delay) = self.root_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.root_exists().await
    }

    async fn create_root(&self, marker: &RootMarker) -> Result<()> {
        self.inner.create_root(marker).await
    }

    async fn read_root(&self) -> Result<RootMarker> {
        self.inner.read_root().await
    }

    async fn remove_root(&self) -> Result<()> {
        self.inner.remove_root().await
    }

    async fn register_client(&self, client: &ClientInfo) -> Result<()> {
        self.inner.register_client(client).await
    }

    async fn document_exists(&self, document: &DocumentId) -> Result<bool> {
        self.inner.document_exists(document).await
    }

    async fn create_document(&self, info: &DocumentInfo) -> Result<()> {
        self.inner.create_document(info).await
    }

    async fn read_document(&self, document: &DocumentId) -> Result<DocumentInfo> {
        self.inner.read_document(document).await
    }

    async fn remove_document(&self, document: &DocumentId) -> Result<()> {
        self.inner.remove_document(document).await
    }

    async fn append_changes(&self, document: &DocumentId, records: &[SyncChange]) -> Result<()> {
        if let Some(delay) = self.append_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::Transport("disk full".to_string()));
        }
        self.inner.append_changes(document, records).await
    }

    async fn read_changes_since(
        &self,
        document: &DocumentId,
        origin: &ClientId,
        since: u64,
    ) -> Result<Vec<SyncChange>> {
        self.inner.read_changes_since(document, origin, since).await
    }

    async fn change_origins(&self, document: &DocumentId) -> Result<Vec<ClientId>> {
        self.inner.change_origins(document).await
    }
}

/// Create the "app-1" root and the given document on a transport.
pub(crate) async fn fabric_with_document(transport: &dyn SyncTransport, document: &str) {
    transport
        .create_root(&RootMarker::new(ApplicationId::new("app-1").unwrap()))
        .await
        .unwrap();
    transport
        .create_document(&DocumentInfo {
            document: DocumentId::new(document).unwrap(),
            description: "Shopping List".to_string(),
            metadata: BTreeMap::new(),
            created_by: ClientId::new("c1").unwrap(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
