use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use foldercopy_core::{
    ApiErrorClass, DriveClient, DriveError, FILE_LINK_KIND, FOLDER_MIME_TYPE, FileList,
    FileMetadata, FileResource, Owner, ParentReference, Permission,
};
use thiserror::Error;
use tracing::{debug, warn};

use super::checkpoint::{Checkpoint, Item};

pub const PAGE_SIZE: u32 = 1000;
pub const RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

const NATIVE_TYPES: [&str; 7] = [
    FOLDER_MIME_TYPE,
    "application/vnd.google-apps.document",
    "application/vnd.google-apps.spreadsheet",
    "application/vnd.google-apps.presentation",
    "application/vnd.google-apps.drawing",
    "application/vnd.google-apps.form",
    "application/vnd.google-apps.script",
];

/// Remote failures, already sorted by how the engine reacts to them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn message(&self) -> &str {
        match self {
            Self::RateLimited(message)
            | Self::Auth(message)
            | Self::Transient(message)
            | Self::Permanent(message) => message,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<DriveError> for RemoteError {
    fn from(err: DriveError) -> Self {
        let message = err.message();
        match err.classification() {
            Some(ApiErrorClass::RateLimit) => Self::RateLimited(message),
            Some(ApiErrorClass::Auth) => Self::Auth(message),
            Some(ApiErrorClass::Permanent) => Self::Permanent(message),
            // Network and decoding failures are worth another try next slice.
            Some(ApiErrorClass::Transient) | None => Self::Transient(message),
        }
    }
}

/// The slice of the remote storage API the copy engine depends on.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn list(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FileList, RemoteError>;
    async fn copy(
        &self,
        source_id: &str,
        metadata: &FileMetadata,
    ) -> Result<FileResource, RemoteError>;
    async fn insert(&self, metadata: &FileMetadata) -> Result<FileResource, RemoteError>;
    async fn get(&self, file_id: &str) -> Result<FileResource, RemoteError>;
    async fn update(
        &self,
        file_id: &str,
        metadata: &FileMetadata,
    ) -> Result<FileResource, RemoteError>;
    async fn list_permissions(&self, file_id: &str) -> Result<Vec<Permission>, RemoteError>;
    async fn insert_permission(
        &self,
        file_id: &str,
        permission: &Permission,
        send_notification_emails: bool,
    ) -> Result<Permission, RemoteError>;
}

#[async_trait]
impl RemoteStorage for DriveClient {
    async fn list(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<FileList, RemoteError> {
        Ok(self.list_files(query, page_token, page_size).await?)
    }

    async fn copy(
        &self,
        source_id: &str,
        metadata: &FileMetadata,
    ) -> Result<FileResource, RemoteError> {
        Ok(self.copy_file(source_id, metadata).await?)
    }

    async fn insert(&self, metadata: &FileMetadata) -> Result<FileResource, RemoteError> {
        Ok(self.insert_file(metadata).await?)
    }

    async fn get(&self, file_id: &str) -> Result<FileResource, RemoteError> {
        Ok(self.get_file(file_id).await?)
    }

    async fn update(
        &self,
        file_id: &str,
        metadata: &FileMetadata,
    ) -> Result<FileResource, RemoteError> {
        Ok(self.update_file(file_id, metadata).await?)
    }

    async fn list_permissions(&self, file_id: &str) -> Result<Vec<Permission>, RemoteError> {
        Ok(DriveClient::list_permissions(self, file_id).await?)
    }

    async fn insert_permission(
        &self,
        file_id: &str,
        permission: &Permission,
        send_notification_emails: bool,
    ) -> Result<Permission, RemoteError> {
        Ok(DriveClient::insert_permission(self, file_id, permission, send_notification_emails).await?)
    }
}

/// Broken traversal invariants. These abort the slice.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("item {item_id} has no parent")]
    MissingParent { item_id: String },
    #[error("parent {parent_id} of item {item_id} was never mapped")]
    UnmappedParent { item_id: String, parent_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildPage {
    pub items: Vec<Item>,
    pub next_page_token: Option<String>,
}

/// Result of copying one item. `id` is the new id on success, the source id otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOutcome {
    pub id: String,
    pub title: String,
    pub err_message: Option<String>,
    /// The folder was reached through another parent and already has a copy; `id` is that copy.
    pub already_copied: bool,
}

impl CopyOutcome {
    pub fn is_success(&self) -> bool {
        self.err_message.is_none() && !self.already_copied
    }
}

pub fn is_native_type(mime_type: &str) -> bool {
    NATIVE_TYPES.contains(&mime_type)
}

pub fn open_link(id: &str) -> String {
    format!("https://drive.google.com/open?id={id}")
}

#[derive(Clone)]
pub struct RemoteTreeClient {
    remote: Arc<dyn RemoteStorage>,
    rate_limit_delay: Duration,
}

impl RemoteTreeClient {
    pub fn new(remote: Arc<dyn RemoteStorage>) -> Self {
        Self {
            remote,
            rate_limit_delay: RATE_LIMIT_DELAY,
        }
    }

    pub fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStorage> {
        &self.remote
    }

    /// Non-trashed direct children of `folder_id`.
    pub fn build_query(folder_id: &str) -> String {
        let escaped = folder_id.replace('\\', "\\\\").replace('\'', "\\'");
        format!("'{escaped}' in parents and trashed = false")
    }

    pub async fn list_children(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, RemoteError> {
        let list = self
            .with_rate_limit_retry("list", || self.remote.list(query, page_token, PAGE_SIZE))
            .await?;
        Ok(ChildPage {
            items: list.items.into_iter().map(Item::from).collect(),
            next_page_token: list.next_page_token.filter(|token| !token.is_empty()),
        })
    }

    /// Copies `item` under the mapped destination of its first parent.
    ///
    /// Remote failures come back inside the outcome. A successful folder copy maps the
    /// folder and queues it for listing. A folder that is already mapped is not copied again.
    pub async fn copy_item(
        &self,
        item: &Item,
        checkpoint: &mut Checkpoint,
    ) -> Result<CopyOutcome, CopyError> {
        if item.is_folder() {
            if let Some(existing) = checkpoint.mapping.get(&item.id) {
                debug!(source = %item.id, dest = %existing, "folder already copied");
                return Ok(CopyOutcome {
                    id: existing.to_string(),
                    title: item.title.clone(),
                    err_message: None,
                    already_copied: true,
                });
            }
        }
        let parent = item.first_parent().ok_or_else(|| CopyError::MissingParent {
            item_id: item.id.clone(),
        })?;
        let dest_parent =
            checkpoint
                .mapping
                .get(&parent.id)
                .ok_or_else(|| CopyError::UnmappedParent {
                    item_id: item.id.clone(),
                    parent_id: parent.id.clone(),
                })?;
        let parents = vec![ParentReference {
            kind: Some(
                parent
                    .kind
                    .clone()
                    .unwrap_or_else(|| FILE_LINK_KIND.to_string()),
            ),
            id: dest_parent.to_string(),
        }];

        let result = if item.is_folder() {
            let metadata = FileMetadata {
                title: Some(item.title.clone()),
                description: item.description.clone(),
                mime_type: Some(FOLDER_MIME_TYPE.to_string()),
                parents,
                labels: None,
            };
            self.with_rate_limit_retry("insert", || self.remote.insert(&metadata))
                .await
        } else {
            let metadata = FileMetadata {
                title: Some(item.title.clone()),
                parents,
                ..FileMetadata::default()
            };
            self.with_rate_limit_retry("copy", || self.remote.copy(&item.id, &metadata))
                .await
        };

        match result {
            Ok(created) => {
                let newly_mapped = item.is_folder()
                    && checkpoint.mapping.insert(item.id.clone(), created.id.clone());
                if newly_mapped {
                    checkpoint.pending.push(item.id.clone());
                }
                debug!(source = %item.id, dest = %created.id, "copied item");
                let title = if created.title.is_empty() {
                    item.title.clone()
                } else {
                    created.title
                };
                Ok(CopyOutcome {
                    id: created.id,
                    title,
                    err_message: None,
                    already_copied: false,
                })
            }
            Err(err) => {
                warn!(source = %item.id, error = %err, "item copy failed");
                Ok(CopyOutcome {
                    id: item.id.clone(),
                    title: item.title.clone(),
                    err_message: Some(err.message().to_string()),
                    already_copied: false,
                })
            }
        }
    }

    /// Re-creates the sharing of `source_id` on `dest_id` without notifying anyone.
    /// Owners of the source become writers on the copy. Returns how many grants were made.
    pub async fn copy_permissions(
        &self,
        source_id: &str,
        owners: &[Owner],
        dest_id: &str,
    ) -> Result<usize, RemoteError> {
        let existing = self
            .with_rate_limit_retry("list permissions", || {
                self.remote.list_permissions(source_id)
            })
            .await?;

        let grants = existing
            .into_iter()
            .filter(|permission| permission.role != "owner")
            .map(|permission| Permission {
                id: None,
                value: permission
                    .value
                    .or(permission.email_address)
                    .or(permission.domain),
                email_address: None,
                domain: None,
                ..permission
            })
            .chain(owners.iter().filter_map(|owner| {
                owner.email_address.as_ref().map(|email| Permission {
                    id: None,
                    role: "writer".to_string(),
                    permission_type: "user".to_string(),
                    value: Some(email.clone()),
                    email_address: None,
                    domain: None,
                    with_link: None,
                })
            }));

        let mut granted = 0;
        for grant in grants {
            self.with_rate_limit_retry("insert permission", || {
                self.remote.insert_permission(dest_id, &grant, false)
            })
            .await?;
            granted += 1;
        }
        Ok(granted)
    }

    async fn with_rate_limit_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RemoteError>>,
    {
        match op().await {
            Err(err) if err.is_rate_limited() => {
                warn!(what, delay_ms = self.rate_limit_delay.as_millis() as u64, "rate limited; retrying once");
                tokio::time::sleep(self.rate_limit_delay).await;
                op().await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::testing::{FakeDrive, file, folder};

    fn tree(drive: &Arc<FakeDrive>) -> RemoteTreeClient {
        RemoteTreeClient::new(drive.clone()).with_rate_limit_delay(Duration::ZERO)
    }

    #[test]
    fn query_selects_untrashed_children() {
        assert_eq!(
            RemoteTreeClient::build_query("abc"),
            "'abc' in parents and trashed = false"
        );
        assert_eq!(
            RemoteTreeClient::build_query("o'brien"),
            "'o\\'brien' in parents and trashed = false"
        );
    }

    #[test]
    fn native_types_are_exactly_seven() {
        for mime in NATIVE_TYPES {
            assert!(is_native_type(mime));
        }
        for mime in [
            "application/pdf",
            "text/plain",
            "application/vnd.google-apps.shortcut",
            "application/vnd.google-apps.site",
            "",
        ] {
            assert!(!is_native_type(mime), "{mime}");
        }
    }

    #[test]
    fn drive_errors_are_classified() {
        let err = DriveError::Api {
            status: reqwest_status(429),
            body: String::new(),
        };
        assert!(RemoteError::from(err).is_rate_limited());
        let err = DriveError::Api {
            status: reqwest_status(404),
            body: r#"{"error":{"message":"File not found: x"}}"#.into(),
        };
        assert_eq!(
            RemoteError::from(err),
            RemoteError::Permanent("File not found: x".into())
        );
    }

    fn reqwest_status(code: u16) -> foldercopy_core::StatusCode {
        foldercopy_core::StatusCode::from_u16(code).unwrap()
    }

    #[tokio::test]
    async fn folder_copy_maps_and_queues() {
        let drive = Arc::new(FakeDrive::new("root"));
        let sub = folder("sub", "root");
        drive.add(sub.clone());
        let mut checkpoint = Checkpoint::fresh("root", "dest-root", false);
        let pending_before = checkpoint.pending.occurrences("sub");

        let outcome = tree(&drive)
            .copy_item(&Item::from(sub), &mut checkpoint)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(checkpoint.mapping.get("sub"), Some(outcome.id.as_str()));
        assert_eq!(checkpoint.pending.occurrences("sub"), pending_before + 1);
        let created = drive.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].metadata.mime_type.as_deref(), Some(FOLDER_MIME_TYPE));
        assert_eq!(created[0].metadata.parents[0].id, "dest-root");
        assert_eq!(
            created[0].metadata.parents[0].kind.as_deref(),
            Some("drive#parentReference")
        );
    }

    #[tokio::test]
    async fn mapped_folder_is_not_copied_or_queued_again() {
        let drive = Arc::new(FakeDrive::new("root"));
        let shared = folder("shared", "root");
        drive.add(shared.clone());
        let mut checkpoint = Checkpoint::fresh("root", "dest-root", false);
        let tree = tree(&drive);

        let first = tree
            .copy_item(&Item::from(shared.clone()), &mut checkpoint)
            .await
            .unwrap();
        let second = tree
            .copy_item(&Item::from(shared), &mut checkpoint)
            .await
            .unwrap();

        assert!(first.is_success());
        assert!(second.already_copied);
        assert!(!second.is_success());
        assert_eq!(second.id, first.id);
        assert_eq!(checkpoint.pending.occurrences("shared"), 1);
        assert_eq!(drive.created().len(), 1);
    }

    #[tokio::test]
    async fn file_copy_leaves_traversal_state_alone() {
        let drive = Arc::new(FakeDrive::new("root"));
        let doc = file("doc", "root");
        drive.add(doc.clone());
        let mut checkpoint = Checkpoint::fresh("root", "dest-root", false);
        let before = checkpoint.clone();

        let outcome = tree(&drive)
            .copy_item(&Item::from(doc), &mut checkpoint)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(checkpoint, before);
        assert_eq!(drive.created()[0].source_id.as_deref(), Some("doc"));
    }

    #[tokio::test]
    async fn failed_folder_is_not_descended_into() {
        let drive = Arc::new(FakeDrive::new("root"));
        let sub = folder("sub", "root");
        drive.add(sub.clone());
        drive.fail_copy("sub", RemoteError::Permanent("Insufficient permissions".into()));
        let mut checkpoint = Checkpoint::fresh("root", "dest-root", false);
        let before = checkpoint.clone();

        let outcome = tree(&drive)
            .copy_item(&Item::from(sub), &mut checkpoint)
            .await
            .unwrap();

        assert_eq!(outcome.id, "sub");
        assert_eq!(outcome.err_message.as_deref(), Some("Insufficient permissions"));
        assert_eq!(checkpoint, before);
    }

    #[tokio::test]
    async fn unmapped_parent_is_fatal() {
        let drive = Arc::new(FakeDrive::new("root"));
        let orphan = file("orphan", "elsewhere");
        let mut checkpoint = Checkpoint::fresh("root", "dest-root", false);

        let err = tree(&drive)
            .copy_item(&Item::from(orphan), &mut checkpoint)
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::UnmappedParent { .. }));
        assert!(drive.created().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_is_retried_exactly_once() {
        let drive = Arc::new(FakeDrive::new("root"));
        let doc = file("doc", "root");
        drive.add(doc.clone());
        drive.rate_limit_next_copies(2);
        let mut checkpoint = Checkpoint::fresh("root", "dest-root", false);

        let outcome = tree(&drive)
            .copy_item(&Item::from(doc), &mut checkpoint)
            .await
            .unwrap();

        assert_eq!(outcome.err_message.as_deref(), Some("User rate limit exceeded"));
        assert_eq!(drive.copy_attempts(), 2);
    }

    #[tokio::test]
    async fn listing_pages_through_children() {
        let drive = Arc::new(FakeDrive::new("root").with_page_size(2));
        for n in 0..3 {
            drive.add(file(&format!("f{n}"), "root"));
        }
        let client = tree(&drive);
        let query = RemoteTreeClient::build_query("root");

        let first = client.list_children(&query, None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let token = first.next_page_token.expect("second page");
        let second = client.list_children(&query, Some(&token)).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn permissions_skip_owner_role_and_add_owners_as_writers() {
        let drive = Arc::new(FakeDrive::new("root"));
        drive.set_permissions(
            "doc",
            vec![
                Permission {
                    id: Some("p-owner".into()),
                    role: "owner".into(),
                    permission_type: "user".into(),
                    value: None,
                    email_address: Some("owner@example.com".into()),
                    domain: None,
                    with_link: None,
                },
                Permission {
                    id: Some("p-reader".into()),
                    role: "reader".into(),
                    permission_type: "user".into(),
                    value: None,
                    email_address: Some("reader@example.com".into()),
                    domain: None,
                    with_link: None,
                },
            ],
        );
        let owners = vec![Owner {
            email_address: Some("owner@example.com".into()),
            display_name: None,
            permission_id: None,
        }];

        let granted = tree(&drive)
            .copy_permissions("doc", &owners, "new-doc")
            .await
            .unwrap();

        assert_eq!(granted, 2);
        let inserted = drive.inserted_permissions();
        assert!(inserted.iter().all(|(id, _, notify)| id == "new-doc" && !notify));
        let grants: Vec<_> = inserted
            .iter()
            .map(|(_, p, _)| (p.role.as_str(), p.value.as_deref()))
            .collect();
        assert_eq!(
            grants,
            vec![
                ("reader", Some("reader@example.com")),
                ("writer", Some("owner@example.com")),
            ]
        );
    }
}
