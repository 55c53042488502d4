use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::storage::{ProgressSink, timestamp_now};

use super::budget::{ExecutionBudget, Exhaustion};
use super::checkpoint::{Checkpoint, InFlightPage, Item};
use super::remote::{
    CopyError, CopyOutcome, RemoteError, RemoteTreeClient, is_native_type, open_link,
};

/// What the next unit of work is, read off the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DrainingCurrentPage,
    FetchingNextPage,
    AdvancingFolder,
    Idle,
}

impl Phase {
    pub fn of(checkpoint: &Checkpoint) -> Self {
        if checkpoint.in_flight.has_items() {
            Self::DrainingCurrentPage
        } else if checkpoint.in_flight.has_more_pages() {
            Self::FetchingNextPage
        } else if !checkpoint.pending.is_empty() {
            Self::AdvancingFolder
        } else {
            Self::Idle
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    Completed,
    TimedOut,
    Stopped,
    /// A listing failed in a way worth retrying on the next slice.
    Interrupted(String),
}

impl From<Exhaustion> for TerminalReason {
    fn from(exhaustion: Exhaustion) -> Self {
        match exhaustion {
            Exhaustion::TimedOut => Self::TimedOut,
            Exhaustion::Stopped => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceReport {
    pub reason: TerminalReason,
    pub copied: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Copy(#[from] CopyError),
}

enum ItemResult {
    Copied,
    Failed,
    AlreadyCopied,
}

/// Walks the source tree depth first, one item or one listing per step.
pub struct CopyEngine {
    tree: RemoteTreeClient,
    sink: Arc<dyn ProgressSink>,
}

impl CopyEngine {
    pub fn new(tree: RemoteTreeClient, sink: Arc<dyn ProgressSink>) -> Self {
        Self { tree, sink }
    }

    /// Advances `checkpoint` until the tree is copied or the budget runs out.
    ///
    /// On return `checkpoint` is exactly the state to persist; an item is either copied and
    /// gone from the in-flight page or still on it.
    pub async fn run(
        &self,
        budget: &ExecutionBudget,
        checkpoint: &mut Checkpoint,
    ) -> Result<SliceReport, EngineError> {
        let mut copied = 0;
        let mut failed = 0;

        let reason = loop {
            let phase = Phase::of(checkpoint);
            if phase != Phase::Idle {
                if let Some(exhaustion) = budget.exhaustion().await {
                    break exhaustion.into();
                }
            }

            match phase {
                Phase::Idle => break TerminalReason::Completed,
                Phase::DrainingCurrentPage => {
                    let Some(item) = checkpoint.in_flight.items.pop_front() else {
                        continue;
                    };
                    match self.copy_one(&item, checkpoint).await? {
                        ItemResult::Copied => copied += 1,
                        ItemResult::Failed => failed += 1,
                        ItemResult::AlreadyCopied => {}
                    }
                }
                Phase::FetchingNextPage => {
                    if let Err(err) = self.fetch_next_page(checkpoint).await {
                        break TerminalReason::Interrupted(err.message().to_string());
                    }
                }
                Phase::AdvancingFolder => {
                    if let Err(err) = self.advance_folder(checkpoint).await {
                        break TerminalReason::Interrupted(err.message().to_string());
                    }
                }
            }
        };

        info!(?reason, copied, failed, "slice finished");
        Ok(SliceReport {
            reason,
            copied,
            failed,
        })
    }

    async fn copy_one(
        &self,
        item: &Item,
        checkpoint: &mut Checkpoint,
    ) -> Result<ItemResult, EngineError> {
        let outcome = self.tree.copy_item(item, checkpoint).await?;
        self.record_outcome(&outcome).await;
        if outcome.already_copied {
            return Ok(ItemResult::AlreadyCopied);
        }

        if outcome.is_success() && checkpoint.copy_permissions && is_native_type(&item.mime_type) {
            if let Err(err) = self
                .tree
                .copy_permissions(&item.id, &item.owners, &outcome.id)
                .await
            {
                warn!(source = %item.id, error = %err, "permission copy failed");
                self.append(vec![
                    format!("Error copying permissions, {}", err.message()),
                    item.title.clone(),
                    open_link(&outcome.id),
                    outcome.id.clone(),
                    timestamp_now(),
                ])
                .await;
            }
        }
        Ok(if outcome.is_success() {
            ItemResult::Copied
        } else {
            ItemResult::Failed
        })
    }

    /// Only retryable errors come back; permanent ones abandon the rest of the folder.
    async fn fetch_next_page(&self, checkpoint: &mut Checkpoint) -> Result<(), RemoteError> {
        let Some(folder_id) = checkpoint.in_flight.folder_id.clone() else {
            warn!("continuation token without a folder; dropping it");
            checkpoint.in_flight.clear();
            return Ok(());
        };
        let query = RemoteTreeClient::build_query(&folder_id);
        let token = checkpoint.in_flight.next_page_token.clone();

        match self.tree.list_children(&query, token.as_deref()).await {
            Ok(page) => {
                debug!(folder = %folder_id, items = page.items.len(), "fetched next page");
                checkpoint.in_flight.items = page.items.into();
                checkpoint.in_flight.next_page_token = page.next_page_token;
                Ok(())
            }
            Err(err) if err.is_permanent() => {
                self.record_listing_failure(&folder_id, &err).await;
                checkpoint.in_flight.clear();
                Ok(())
            }
            Err(err) => {
                warn!(folder = %folder_id, error = %err, "listing interrupted");
                Err(err)
            }
        }
    }

    /// The folder stays on the pending stack until its first page is in hand.
    async fn advance_folder(&self, checkpoint: &mut Checkpoint) -> Result<(), RemoteError> {
        let Some(folder_id) = checkpoint.pending.peek().map(str::to_string) else {
            return Ok(());
        };
        let query = RemoteTreeClient::build_query(&folder_id);

        match self.tree.list_children(&query, None).await {
            Ok(page) => {
                checkpoint.pending.pop();
                debug!(folder = %folder_id, items = page.items.len(), "listing folder");
                checkpoint.in_flight = InFlightPage {
                    folder_id: Some(folder_id),
                    items: page.items.into(),
                    next_page_token: page.next_page_token,
                };
                Ok(())
            }
            Err(err) if err.is_permanent() => {
                checkpoint.pending.pop();
                self.record_listing_failure(&folder_id, &err).await;
                Ok(())
            }
            Err(err) => {
                warn!(folder = %folder_id, error = %err, "listing interrupted");
                Err(err)
            }
        }
    }

    async fn record_outcome(&self, outcome: &CopyOutcome) {
        let status = match &outcome.err_message {
            Some(message) => format!("Error, {message}"),
            None if outcome.already_copied => "Already copied".to_string(),
            None => "Copied".to_string(),
        };
        self.append(vec![
            status,
            outcome.title.clone(),
            open_link(&outcome.id),
            outcome.id.clone(),
            timestamp_now(),
        ])
        .await;
    }

    async fn record_listing_failure(&self, folder_id: &str, err: &RemoteError) {
        warn!(folder = %folder_id, error = %err, "abandoning folder listing");
        self.append(vec![
            format!("Error listing folder, {}", err.message()),
            String::new(),
            open_link(folder_id),
            folder_id.to_string(),
            timestamp_now(),
        ])
        .await;
    }

    async fn append(&self, row: Vec<String>) {
        if let Err(err) = self.sink.append(&row).await {
            warn!(error = %err, "failed to write progress row");
        }
    }
}
