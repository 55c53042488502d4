//! Resumable, time-boxed folder tree copy.

mod backoff;
mod budget;
pub mod checkpoint;
mod engine;
mod identity;
mod remote;
mod reschedule;
mod slice;
#[cfg(test)]
pub(crate) mod testing;

pub use backoff::Backoff;
pub use budget::{DEFAULT_MAX_DURATION, ExecutionBudget, Exhaustion, StopProbe, StoredStopFlag};
pub use checkpoint::{
    Checkpoint, CheckpointError, InFlightPage, Item, Mapping, PendingQueue, file_list_exists,
};
pub use engine::{CopyEngine, EngineError, Phase, SliceReport, TerminalReason};
pub use identity::{
    DEST_ID_KEY, JobIdentity, PROGRESS_LOG_ID_KEY, PROPERTIES_DOC_ID_KEY, SOURCE_ID_KEY, STOP_KEY,
    TRIALS_KEY, TRIGGER_ID_KEY,
};
pub use remote::{
    ChildPage, CopyError, CopyOutcome, PAGE_SIZE, RATE_LIMIT_DELAY, RemoteError, RemoteStorage,
    RemoteTreeClient, is_native_type, open_link,
};
pub use reschedule::{
    COMPLETE_STATUS, DEFAULT_RESCHEDULE_AFTER, PAUSED_MESSAGE, RescheduleController, Resolution,
    STOPPED_MESSAGE,
};
pub use slice::{GIVE_UP_MESSAGE, MAX_LOAD_TRIALS, SliceError, SliceOutcome, SliceRunner, SliceSettings};
