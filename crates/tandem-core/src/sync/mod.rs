//! Sync engine: manager, conflict resolver, scheduler and notification listener

mod events;
mod manager;
mod notifications;
mod resolver;
mod scheduler;

pub use events::{CycleAbort, EntityReport, PhaseCounts, SyncEvent, SyncReport};
pub use manager::{SyncManager, SyncOptions, DEFAULT_BATCH_SIZE};
pub use notifications::NotificationClient;
pub use resolver::{ConflictResolver, Resolution};
pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerHandle, ShutdownOutcome, DEFAULT_DEBOUNCE,
    DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_SYNC_INTERVAL, MAX_PULL_DELAY_FACTOR,
};
