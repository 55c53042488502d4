use std::path::{Path, PathBuf};

use async_trait::async_trait;
use foldercopy_core::{DriveClient, DriveError, FileMetadata, PLAIN_TEXT_MIME_TYPE, ParentReference};
use tracing::debug;

use super::StoreError;

pub const CHECKPOINT_DOCUMENT_TITLE: &str =
    "DO NOT DELETE OR MODIFY - will be deleted after copying completes";

/// A single text document addressed by id, used to hold the serialized checkpoint.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create(&self, title: &str, parent_id: &str) -> Result<String, StoreError>;
    async fn read(&self, doc_id: &str) -> Result<String, StoreError>;
    async fn write(&self, doc_id: &str, content: &str) -> Result<(), StoreError>;
    async fn trash(&self, doc_id: &str) -> Result<(), StoreError>;
}

/// Plain-text file stored next to the copy in the remote destination folder.
#[derive(Clone)]
pub struct RemoteDocumentStore {
    client: DriveClient,
}

impl RemoteDocumentStore {
    pub fn new(client: DriveClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DocumentStore for RemoteDocumentStore {
    async fn create(&self, title: &str, parent_id: &str) -> Result<String, StoreError> {
        let created = self
            .client
            .insert_file(&FileMetadata {
                title: Some(title.to_string()),
                mime_type: Some(PLAIN_TEXT_MIME_TYPE.to_string()),
                parents: vec![ParentReference::file_link(parent_id)],
                ..FileMetadata::default()
            })
            .await?;
        Ok(created.id)
    }

    async fn read(&self, doc_id: &str) -> Result<String, StoreError> {
        self.client
            .download_text(doc_id)
            .await
            .map_err(|err| not_found_or(err, doc_id))
    }

    async fn write(&self, doc_id: &str, content: &str) -> Result<(), StoreError> {
        self.client
            .upload_text(doc_id, content)
            .await
            .map_err(|err| not_found_or(err, doc_id))?;
        Ok(())
    }

    async fn trash(&self, doc_id: &str) -> Result<(), StoreError> {
        self.client.trash_file(doc_id).await?;
        Ok(())
    }
}

fn not_found_or(err: DriveError, doc_id: &str) -> StoreError {
    match err {
        DriveError::Api { status, .. } if status.as_u16() == 404 => {
            StoreError::DocumentNotFound(doc_id.to_string())
        }
        other => StoreError::Remote(other),
    }
}

/// Documents kept as files under a local state directory.
#[derive(Clone, Debug)]
pub struct LocalDocumentStore {
    root: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_path(&self, doc_id: &str) -> Result<PathBuf, StoreError> {
        validate_id(doc_id)?;
        Ok(self.root.join("documents").join(format!("{doc_id}.json")))
    }

    fn trash_path(&self, doc_id: &str) -> Result<PathBuf, StoreError> {
        validate_id(doc_id)?;
        Ok(self.root.join("trash").join(format!("{doc_id}.json")))
    }
}

fn validate_id(doc_id: &str) -> Result<(), StoreError> {
    let valid = !doc_id.is_empty()
        && doc_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidDocumentId(doc_id.to_string()))
    }
}

async fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn create(&self, title: &str, parent_id: &str) -> Result<String, StoreError> {
        let doc_id = uuid::Uuid::new_v4().to_string();
        write_atomic(&self.document_path(&doc_id)?, "").await?;
        debug!(doc_id, title, parent_id, "created local checkpoint document");
        Ok(doc_id)
    }

    async fn read(&self, doc_id: &str) -> Result<String, StoreError> {
        match tokio::fs::read_to_string(self.document_path(doc_id)?).await {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::DocumentNotFound(doc_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, doc_id: &str, content: &str) -> Result<(), StoreError> {
        let path = self.document_path(doc_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::DocumentNotFound(doc_id.to_string()));
        }
        write_atomic(&path, content).await
    }

    async fn trash(&self, doc_id: &str) -> Result<(), StoreError> {
        let from = self.document_path(doc_id)?;
        let to = self.trash_path(doc_id)?;
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::DocumentNotFound(doc_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: std::sync::Mutex<std::collections::HashMap<String, String>>,
    trashed: std::sync::Mutex<Vec<String>>,
    failing_reads: std::sync::atomic::AtomicU32,
    fail_writes: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryDocumentStore {
    pub fn insert(&self, doc_id: &str, content: &str) {
        self.docs
            .lock()
            .unwrap()
            .insert(doc_id.to_string(), content.to_string());
    }

    pub fn content(&self, doc_id: &str) -> Option<String> {
        self.docs.lock().unwrap().get(doc_id).cloned()
    }

    pub fn trashed(&self) -> Vec<String> {
        self.trashed.lock().unwrap().clone()
    }

    /// The next `count` reads fail with an I/O error.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create(&self, _title: &str, _parent_id: &str) -> Result<String, StoreError> {
        let doc_id = uuid::Uuid::new_v4().to_string();
        self.insert(&doc_id, "");
        Ok(doc_id)
    }

    async fn read(&self, doc_id: &str) -> Result<String, StoreError> {
        use std::sync::atomic::Ordering;
        let remaining = self.failing_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_reads.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Io(std::io::Error::other("read failed")));
        }
        self.content(doc_id)
            .ok_or_else(|| StoreError::DocumentNotFound(doc_id.to_string()))
    }

    async fn write(&self, doc_id: &str, content: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("write failed")));
        }
        self.insert(doc_id, content);
        Ok(())
    }

    async fn trash(&self, doc_id: &str) -> Result<(), StoreError> {
        self.docs.lock().unwrap().remove(doc_id);
        self.trashed.lock().unwrap().push(doc_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn local_store_writes_reads_and_trashes() {
        let dir = tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());

        let doc_id = store
            .create(CHECKPOINT_DOCUMENT_TITLE, "dest")
            .await
            .unwrap();
        assert_eq!(store.read(&doc_id).await.unwrap(), "");

        store.write(&doc_id, "{\"remaining\":[]}").await.unwrap();
        assert_eq!(store.read(&doc_id).await.unwrap(), "{\"remaining\":[]}");

        store.trash(&doc_id).await.unwrap();
        assert!(matches!(
            store.read(&doc_id).await,
            Err(StoreError::DocumentNotFound(_))
        ));
        assert!(dir.path().join("trash").join(format!("{doc_id}.json")).exists());
    }

    #[tokio::test]
    async fn local_store_rejects_path_like_ids() {
        let dir = tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());
        assert!(matches!(
            store.read("../secret").await,
            Err(StoreError::InvalidDocumentId(_))
        ));
    }

    #[tokio::test]
    async fn local_store_write_requires_existing_document() {
        let dir = tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());
        assert!(matches!(
            store.write("missing", "{}").await,
            Err(StoreError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn remote_store_creates_plain_text_document_in_parent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drive/v2/files"))
            .and(body_json(json!({
                "title": CHECKPOINT_DOCUMENT_TITLE,
                "mimeType": "text/plain",
                "parents": [{ "kind": "drive#fileLink", "id": "dest" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "doc-7" })))
            .mount(&server)
            .await;

        let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
        let store = RemoteDocumentStore::new(client);
        let doc_id = store
            .create(CHECKPOINT_DOCUMENT_TITLE, "dest")
            .await
            .unwrap();
        assert_eq!(doc_id, "doc-7");
    }

    #[tokio::test]
    async fn remote_store_maps_missing_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v2/files/doc-7"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "code": 404, "message": "File not found" }
            })))
            .mount(&server)
            .await;

        let client = DriveClient::with_base_url(&server.uri(), "test-token").unwrap();
        let store = RemoteDocumentStore::new(client);
        assert!(matches!(
            store.read("doc-7").await,
            Err(StoreError::DocumentNotFound(_))
        ));
    }
}
