//! Durable snapshot of traversal progress.
//!
//! The document is a single JSON object:
//!
//! ```json
//! {
//!   "remaining": ["folder-b", "folder-c"],
//!   "map": { "root": "dest-root", "folder-b": "dest-b" },
//!   "permissions": false,
//!   "leftovers": { "folderId": "folder-a", "items": [ ... ], "nextPageToken": "..." },
//!   "destId": "dest-root"
//! }
//! ```
//!
//! Older documents stored every top-level field (and `leftovers.items`) as a JSON-encoded
//! string; those are decoded transparently on load and rewritten natively on save.

use std::collections::{BTreeMap, VecDeque};

use foldercopy_core::{FOLDER_MIME_TYPE, FileResource, Owner, ParentReference};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::storage::{DocumentStore, StoreError};

use super::backoff::Backoff;

/// Attempts made by [`load_with_backoff`] before the load is declared failed.
pub const LOAD_ATTEMPTS: u32 = 6;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),
    #[error("checkpoint document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("checkpoint document is empty")]
    Empty,
}

/// Snapshot of a remote file or folder, as listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parents: Vec<ParentReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<Owner>,
}

impl Item {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn first_parent(&self) -> Option<&ParentReference> {
        self.parents.first()
    }
}

impl From<FileResource> for Item {
    fn from(resource: FileResource) -> Self {
        Self {
            id: resource.id,
            title: resource.title,
            mime_type: resource.mime_type,
            description: resource.description,
            parents: resource.parents,
            owners: resource.owners,
        }
    }
}

/// Append-only source id to destination id correspondence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mapping(BTreeMap<String, String>);

impl Mapping {
    /// Returns `false` and leaves the existing value alone if `source_id` is already mapped.
    pub fn insert(&mut self, source_id: impl Into<String>, dest_id: impl Into<String>) -> bool {
        match self.0.entry(source_id.into()) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(dest_id.into());
                true
            }
        }
    }

    pub fn get(&self, source_id: &str) -> Option<&str> {
        self.0.get(source_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// LIFO stack of source folder ids whose children still need copying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingQueue(Vec<String>);

impl PendingQueue {
    pub fn push(&mut self, folder_id: impl Into<String>) {
        self.0.push(folder_id.into());
    }

    pub fn pop(&mut self) -> Option<String> {
        self.0.pop()
    }

    pub fn peek(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn occurrences(&self, folder_id: &str) -> usize {
        self.0.iter().filter(|id| *id == folder_id).count()
    }
}

/// Unconsumed children of the folder currently being listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightPage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub items: VecDeque<Item>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

impl InFlightPage {
    pub fn has_items(&self) -> bool {
        !self.items.is_empty()
    }

    pub fn has_more_pages(&self) -> bool {
        self.next_page_token.is_some()
    }

    pub fn is_exhausted(&self) -> bool {
        !self.has_items() && !self.has_more_pages()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Builds a page from a stored `leftovers` value, tolerating every historical shape.
    fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let value = decode_embedded(value).unwrap_or(Value::Null);
        let (items_value, token, folder_id) = match value {
            Value::Array(_) => (value, None, None),
            Value::Object(mut fields) => {
                let items = fields
                    .remove("items")
                    .and_then(|items| decode_embedded(items).ok())
                    .unwrap_or(Value::Null);
                let token = fields
                    .remove("nextPageToken")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .filter(|t| !t.is_empty());
                let folder_id = fields
                    .remove("folderId")
                    .and_then(|v| v.as_str().map(str::to_string));
                (items, token, folder_id)
            }
            _ => return Ok(Self::default()),
        };

        let items: VecDeque<Item> = if file_list_exists(&items_value) {
            serde_json::from_value(items_value)?
        } else {
            VecDeque::new()
        };
        // Older documents never stored the folder; every item on a page shares it.
        let folder_id = folder_id.or_else(|| {
            items
                .front()
                .and_then(Item::first_parent)
                .map(|parent| parent.id.clone())
        });
        Ok(Self {
            folder_id,
            items,
            next_page_token: token,
        })
    }
}

/// Only a non-empty array counts as a list of items in flight.
pub fn file_list_exists(value: &Value) -> bool {
    matches!(value, Value::Array(items) if !items.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "remaining", default, deserialize_with = "embedded")]
    pub pending: PendingQueue,
    #[serde(rename = "map", default, deserialize_with = "embedded")]
    pub mapping: Mapping,
    #[serde(rename = "permissions", default, deserialize_with = "embedded")]
    pub copy_permissions: bool,
    #[serde(rename = "leftovers", default, deserialize_with = "in_flight")]
    pub in_flight: InFlightPage,
    #[serde(rename = "destId")]
    pub dest_root: String,
}

impl Checkpoint {
    /// State of a brand-new job: the root is mapped and waiting to be listed.
    pub fn fresh(source_root: &str, dest_root: &str, copy_permissions: bool) -> Self {
        let mut mapping = Mapping::default();
        mapping.insert(source_root, dest_root);
        let mut pending = PendingQueue::default();
        pending.push(source_root);
        Self {
            pending,
            mapping,
            copy_permissions,
            in_flight: InFlightPage::default(),
            dest_root: dest_root.to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_exhausted()
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, CheckpointError> {
        if raw.trim().is_empty() {
            return Err(CheckpointError::Empty);
        }
        let mut checkpoint: Self = serde_json::from_str(raw)?;
        if checkpoint.in_flight.has_more_pages() && checkpoint.in_flight.folder_id.is_none() {
            warn!("dropping continuation token without a folder to continue");
            checkpoint.in_flight.next_page_token = None;
        }
        Ok(checkpoint)
    }
}

pub async fn save(
    store: &dyn DocumentStore,
    doc_id: &str,
    checkpoint: &Checkpoint,
) -> Result<(), CheckpointError> {
    store.write(doc_id, &checkpoint.to_json()?).await?;
    Ok(())
}

pub async fn load(store: &dyn DocumentStore, doc_id: &str) -> Result<Checkpoint, CheckpointError> {
    let raw = store.read(doc_id).await?;
    Checkpoint::from_json(&raw)
}

pub async fn load_with_backoff(
    store: &dyn DocumentStore,
    doc_id: &str,
    backoff: &Backoff,
) -> Result<Checkpoint, CheckpointError> {
    backoff
        .retry(LOAD_ATTEMPTS, "checkpoint load", || load(store, doc_id))
        .await
}

fn decode_embedded(value: Value) -> Result<Value, serde_json::Error> {
    match value {
        Value::String(raw) => serde_json::from_str(&raw),
        other => Ok(other),
    }
}

fn embedded<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    let value = decode_embedded(value).map_err(D::Error::custom)?;
    serde_json::from_value(value).map_err(D::Error::custom)
}

fn in_flight<'de, D>(deserializer: D) -> Result<InFlightPage, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    InFlightPage::from_value(value).map_err(D::Error::custom)
}
