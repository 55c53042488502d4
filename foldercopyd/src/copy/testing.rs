//! In-memory remote storage for engine and job tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use foldercopy_core::{FOLDER_MIME_TYPE, FileList, FileMetadata, FileResource, ParentReference, Permission};

use super::remote::{RemoteError, RemoteStorage};

pub const ROOT_PARENT: &str = "my-drive";

pub fn folder(id: &str, parent: &str) -> FileResource {
    resource(id, parent, FOLDER_MIME_TYPE)
}

pub fn file(id: &str, parent: &str) -> FileResource {
    resource(id, parent, "application/pdf")
}

/// Titles equal ids so failures can be injected for inserts too.
pub fn resource(id: &str, parent: &str, mime_type: &str) -> FileResource {
    FileResource {
        id: id.to_string(),
        title: id.to_string(),
        mime_type: mime_type.to_string(),
        description: None,
        parents: vec![ParentReference {
            kind: Some("drive#parentReference".to_string()),
            id: parent.to_string(),
        }],
        owners: Vec::new(),
    }
}

#[derive(Debug, Clone)]
pub struct CreatedItem {
    pub id: String,
    /// `Some` for copies, `None` for inserts.
    pub source_id: Option<String>,
    pub metadata: FileMetadata,
}

#[derive(Default)]
struct State {
    files: Vec<FileResource>,
    created: Vec<CreatedItem>,
    next_id: u64,
    copy_attempts: u32,
    rate_limited_copies: u32,
    copy_failures: HashMap<String, RemoteError>,
    list_failures: HashMap<String, VecDeque<RemoteError>>,
    list_calls: u32,
    permissions: HashMap<String, Vec<Permission>>,
    inserted_permissions: Vec<(String, Permission, bool)>,
}

pub struct FakeDrive {
    page_size: u32,
    copy_delay: Duration,
    state: Mutex<State>,
}

impl FakeDrive {
    pub fn new(root: &str) -> Self {
        let drive = Self {
            page_size: u32::MAX,
            copy_delay: Duration::ZERO,
            state: Mutex::new(State::default()),
        };
        drive.add(folder(root, ROOT_PARENT));
        drive
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Every copy or insert takes this long on the tokio clock.
    pub fn with_copy_delay(mut self, delay: Duration) -> Self {
        self.copy_delay = delay;
        self
    }

    pub fn add(&self, resource: FileResource) {
        self.state.lock().unwrap().files.push(resource);
    }

    pub fn rate_limit_next_copies(&self, count: u32) {
        self.state.lock().unwrap().rate_limited_copies = count;
    }

    pub fn fail_copy(&self, title: &str, err: RemoteError) {
        self.state
            .lock()
            .unwrap()
            .copy_failures
            .insert(title.to_string(), err);
    }

    pub fn fail_list(&self, folder_id: &str, errors: Vec<RemoteError>) {
        self.state
            .lock()
            .unwrap()
            .list_failures
            .insert(folder_id.to_string(), errors.into());
    }

    pub fn set_permissions(&self, file_id: &str, permissions: Vec<Permission>) {
        self.state
            .lock()
            .unwrap()
            .permissions
            .insert(file_id.to_string(), permissions);
    }

    pub fn created(&self) -> Vec<CreatedItem> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn created_titles(&self) -> Vec<String> {
        self.created()
            .into_iter()
            .filter_map(|item| item.metadata.title)
            .collect()
    }

    pub fn copy_attempts(&self) -> u32 {
        self.state.lock().unwrap().copy_attempts
    }

    pub fn list_calls(&self) -> u32 {
        self.state.lock().unwrap().list_calls
    }

    pub fn inserted_permissions(&self) -> Vec<(String, Permission, bool)> {
        self.state.lock().unwrap().inserted_permissions.clone()
    }

    async fn create(
        &self,
        source_id: Option<&str>,
        metadata: &FileMetadata,
    ) -> Result<FileResource, RemoteError> {
        tokio::time::sleep(self.copy_delay).await;
        let mut state = self.state.lock().unwrap();
        state.copy_attempts += 1;
        if state.rate_limited_copies > 0 {
            state.rate_limited_copies -= 1;
            return Err(RemoteError::RateLimited("User rate limit exceeded".into()));
        }
        let title = metadata.title.clone().unwrap_or_default();
        if let Some(err) = state.copy_failures.get(&title) {
            return Err(err.clone());
        }
        state.next_id += 1;
        let id = format!("new-{}", state.next_id);
        let mime_type = match source_id {
            Some(source_id) => state
                .files
                .iter()
                .find(|f| f.id == source_id)
                .map(|f| f.mime_type.clone())
                .unwrap_or_default(),
            None => metadata.mime_type.clone().unwrap_or_default(),
        };
        state.created.push(CreatedItem {
            id: id.clone(),
            source_id: source_id.map(str::to_string),
            metadata: metadata.clone(),
        });
        Ok(FileResource {
            id,
            title,
            mime_type,
            description: metadata.description.clone(),
            parents: metadata.parents.clone(),
            owners: Vec::new(),
        })
    }
}

fn folder_from_query(query: &str) -> String {
    query
        .strip_prefix('\'')
        .and_then(|rest| rest.split_once("' in parents"))
        .map(|(id, _)| id.replace("\\'", "'"))
        .unwrap_or_default()
}

#[async_trait]
impl RemoteStorage for FakeDrive {
    async fn list(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FileList, RemoteError> {
        let folder_id = folder_from_query(query);
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        if let Some(err) = state
            .list_failures
            .get_mut(&folder_id)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let children: Vec<_> = state
            .files
            .iter()
            .filter(|f| f.parents.iter().any(|p| p.id == folder_id))
            .cloned()
            .collect();
        let offset: usize = page_token
            .and_then(|token| token.strip_prefix("offset-"))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let size = page_size.min(self.page_size) as usize;
        let end = (offset + size).min(children.len());
        let items = children.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = (end < children.len()).then(|| format!("offset-{end}"));
        Ok(FileList {
            items,
            next_page_token,
        })
    }

    async fn copy(
        &self,
        source_id: &str,
        metadata: &FileMetadata,
    ) -> Result<FileResource, RemoteError> {
        self.create(Some(source_id), metadata).await
    }

    async fn insert(&self, metadata: &FileMetadata) -> Result<FileResource, RemoteError> {
        self.create(None, metadata).await
    }

    async fn get(&self, file_id: &str) -> Result<FileResource, RemoteError> {
        self.state
            .lock()
            .unwrap()
            .files
            .iter()
            .find(|f| f.id == file_id)
            .cloned()
            .ok_or_else(|| RemoteError::Permanent(format!("File not found: {file_id}")))
    }

    async fn update(
        &self,
        file_id: &str,
        metadata: &FileMetadata,
    ) -> Result<FileResource, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let found = state
            .files
            .iter_mut()
            .find(|f| f.id == file_id)
            .ok_or_else(|| RemoteError::Permanent(format!("File not found: {file_id}")))?;
        if let Some(title) = &metadata.title {
            found.title = title.clone();
        }
        if metadata.description.is_some() {
            found.description = metadata.description.clone();
        }
        Ok(found.clone())
    }

    async fn list_permissions(&self, file_id: &str) -> Result<Vec<Permission>, RemoteError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .permissions
            .get(file_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_permission(
        &self,
        file_id: &str,
        permission: &Permission,
        send_notification_emails: bool,
    ) -> Result<Permission, RemoteError> {
        self.state.lock().unwrap().inserted_permissions.push((
            file_id.to_string(),
            permission.clone(),
            send_notification_emails,
        ));
        Ok(permission.clone())
    }
}
