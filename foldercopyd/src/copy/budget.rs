use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use crate::storage::KeyValueStore;

use super::identity::STOP_KEY;

/// Stays under the platform's per-invocation ceiling with room to save and reschedule.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_millis(282_000);

/// Source of the externally settable "pause" flag.
#[async_trait]
pub trait StopProbe: Send + Sync {
    async fn is_stopped(&self) -> bool;
}

#[async_trait]
impl StopProbe for AtomicBool {
    async fn is_stopped(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

/// Reads the stop flag from the job's key/value store on every poll.
pub struct StoredStopFlag {
    kv: Arc<dyn KeyValueStore>,
}

impl StoredStopFlag {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl StopProbe for StoredStopFlag {
    async fn is_stopped(&self) -> bool {
        match self.kv.get(STOP_KEY).await {
            Ok(value) => value.as_deref() == Some("true"),
            Err(err) => {
                warn!(error = %err, "failed to read stop flag; continuing");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    TimedOut,
    Stopped,
}

pub struct ExecutionBudget {
    started: Instant,
    max: Duration,
    stop: Arc<dyn StopProbe>,
}

impl ExecutionBudget {
    pub fn new(max: Duration, stop: Arc<dyn StopProbe>) -> Self {
        Self {
            started: Instant::now(),
            max,
            stop,
        }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_time_up(&self) -> bool {
        self.elapsed() >= self.max
    }

    pub async fn is_stopped(&self) -> bool {
        self.stop.is_stopped().await
    }

    pub async fn can_continue(&self) -> bool {
        self.exhaustion().await.is_none()
    }

    /// A manual stop takes precedence over a timeout.
    pub async fn exhaustion(&self) -> Option<Exhaustion> {
        if self.is_stopped().await {
            Some(Exhaustion::Stopped)
        } else if self.is_time_up() {
            Some(Exhaustion::TimedOut)
        } else {
            None
        }
    }
}
