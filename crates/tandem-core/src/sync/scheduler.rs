//! Background worker deciding when the sync manager runs.
//!
//! Cycles start from three sources: the periodic timer, explicit triggers
//! (including local saves), and change notifications. Notification pulls are
//! debounced per entity type and retried while another cycle holds the guard.
//! A steady stream of notifications cannot postpone a pull past
//! [`MAX_PULL_DELAY_FACTOR`] debounce periods after the first one.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::manager::SyncManager;
use crate::error::Error;
use crate::models::LocalId;
use crate::services::LocalChange;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(750);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest wait for a debounced pull, in debounce periods
pub const MAX_PULL_DELAY_FACTOR: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Period of the full cycle timer
    pub interval: Duration,
    /// Quiet time before a notification pull starts
    pub debounce: Duration,
    /// Push every local save right away
    pub push_on_save: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SYNC_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            push_on_save: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    RunCycle,
    PushRecord {
        entity_type: String,
        local_id: LocalId,
    },
    Pull {
        entity_type: String,
    },
}

/// Cheap handle for asking the worker to sync.
///
/// Every method is fire-and-forget; once the worker stopped they do nothing.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Sync scheduler already stopped");
        }
    }

    /// Run a full cycle as soon as possible.
    pub fn trigger(&self) {
        self.send(Command::RunCycle);
    }

    /// Push one record as soon as possible.
    pub fn push_record(&self, entity_type: &str, local_id: LocalId) {
        self.send(Command::PushRecord {
            entity_type: entity_type.to_string(),
            local_id,
        });
    }

    /// Remote state of `entity_type` changed; pull it after the debounce.
    pub fn request_pull(&self, entity_type: &str) {
        self.send(Command::Pull {
            entity_type: entity_type.to_string(),
        });
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        (Self { commands }, receiver)
    }
}

/// How [`Scheduler::shutdown`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The worker finished, including any cycle in flight
    Clean,
    /// The in-flight cycle outlived the timeout and was left behind
    TimedOut,
}

pub struct Scheduler {
    handle: SchedulerHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the worker on the current Tokio runtime.
    ///
    /// The first timer tick fires immediately, so a cycle runs at startup.
    pub fn start(manager: Arc<SyncManager>, config: SchedulerConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let changes = config
            .push_on_save
            .then(|| manager.store().subscribe_changes());
        let worker = Worker {
            manager,
            config,
            commands: receiver,
            shutdown: shutdown_rx,
            changes,
            pending_pulls: BTreeSet::new(),
            pull_deadline: None,
            pull_requested_at: None,
        };
        Self {
            handle: SchedulerHandle { commands },
            shutdown,
            task: tokio::spawn(worker.run()),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// A receiver that flips to `true` once shutdown starts
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop scheduling and wait up to `timeout` for the cycle in flight.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownOutcome {
        self.shutdown.send_replace(true);
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => ShutdownOutcome::Clean,
            Ok(Err(error)) => {
                tracing::error!(%error, "Sync scheduler task failed");
                ShutdownOutcome::Clean
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Sync still running at shutdown; unsynced rows stay pending"
                );
                ShutdownOutcome::TimedOut
            }
        }
    }
}

struct Worker {
    manager: Arc<SyncManager>,
    config: SchedulerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    changes: Option<broadcast::Receiver<LocalChange>>,
    pending_pulls: BTreeSet<String>,
    pull_deadline: Option<Instant>,
    /// When the oldest pending pull was requested
    pull_requested_at: Option<Instant>,
}

async fn next_change(
    changes: &mut Option<broadcast::Receiver<LocalChange>>,
) -> Result<LocalChange, broadcast::error::RecvError> {
    match changes {
        Some(changes) => changes.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Worker {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            "Sync scheduler started"
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = ticker.tick() => self.run_cycle().await,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                change = next_change(&mut self.changes) => self.handle_change(change).await,
                () = sleep_until_deadline(self.pull_deadline) => self.run_pending_pulls().await,
            }
        }
        tracing::info!("Sync scheduler stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RunCycle => self.run_cycle().await,
            Command::PushRecord {
                entity_type,
                local_id,
            } => self.push_record(&entity_type, &local_id).await,
            Command::Pull { entity_type } => {
                if !self.manager.registry().contains(&entity_type) {
                    tracing::debug!(entity_type = %entity_type, "Ignoring notification for unknown entity type");
                    return;
                }
                self.pending_pulls.insert(entity_type);
                self.schedule_pull(Instant::now());
            }
        }
    }

    async fn handle_change(&mut self, change: Result<LocalChange, broadcast::error::RecvError>) {
        match change {
            Ok(change) => {
                tracing::trace!(entity_type = %change.entity_type, kind = ?change.kind, "Local change");
                if self.manager.registry().contains(&change.entity_type) {
                    self.push_record(&change.entity_type, &change.local_id).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Missed local changes; running a full cycle");
                self.run_cycle().await;
            }
            Err(broadcast::error::RecvError::Closed) => self.changes = None,
        }
    }

    async fn run_cycle(&self) {
        match self.manager.run_cycle().await {
            Ok(_) | Err(Error::SyncInProgress) => {}
            Err(error) => tracing::warn!(%error, "Scheduled sync cycle failed"),
        }
    }

    async fn push_record(&self, entity_type: &str, local_id: &LocalId) {
        match self.manager.push_record(entity_type, local_id).await {
            Ok(_) => {}
            // The running cycle or the next one picks the row up
            Err(Error::SyncInProgress) => {
                tracing::debug!(entity_type, local_id = %local_id, "Push deferred; sync busy");
            }
            Err(error) => {
                tracing::warn!(entity_type, local_id = %local_id, %error, "Immediate push failed");
            }
        }
    }

    /// Debounce from `now`, capped relative to the oldest pending request.
    fn schedule_pull(&mut self, now: Instant) {
        let requested_at = *self.pull_requested_at.get_or_insert(now);
        let latest = requested_at + self.config.debounce * MAX_PULL_DELAY_FACTOR;
        self.pull_deadline = Some((now + self.config.debounce).min(latest));
    }

    async fn run_pending_pulls(&mut self) {
        self.pull_deadline = None;
        self.pull_requested_at = None;
        let entity_types = std::mem::take(&mut self.pending_pulls);
        for entity_type in entity_types {
            match self.manager.pull(&entity_type).await {
                Ok(counts) => {
                    tracing::debug!(entity_type = %entity_type, applied = counts.applied, "Notification pull done");
                }
                Err(Error::SyncInProgress) => {
                    self.pending_pulls.insert(entity_type);
                }
                Err(error) => {
                    tracing::warn!(entity_type = %entity_type, %error, "Notification pull failed");
                }
            }
        }
        if !self.pending_pulls.is_empty() {
            self.schedule_pull(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRegistry;
    use crate::models::SyncStatus;
    use crate::remote::LoopbackRemote;
    use crate::services::LocalStore;
    use crate::sync::{SyncEvent, SyncOptions};
    use serde_json::json;

    fn manager(remote: &LoopbackRemote) -> Arc<SyncManager> {
        let store = LocalStore::open_in_memory().unwrap();
        let registry = EntityRegistry::from_names(["topic"]).unwrap();
        Arc::new(
            SyncManager::new(store, Arc::new(remote.clone()), registry, SyncOptions::default())
                .unwrap(),
        )
    }

    fn quiet_config(push_on_save: bool) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(3600),
            debounce: Duration::from_millis(20),
            push_on_save,
        }
    }

    async fn wait_for_cycle(events: &mut broadcast::Receiver<SyncEvent>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::CycleCompleted(_)) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn startup_and_trigger_run_cycles() {
        let remote = LoopbackRemote::standalone();
        let manager = manager(&remote);
        let mut events = manager.subscribe();
        let record = manager
            .store()
            .create_record("topic", &json!({"title": "a"}))
            .unwrap();

        let scheduler = Scheduler::start(Arc::clone(&manager), quiet_config(false));
        wait_for_cycle(&mut events).await;
        let synced = manager.store().get_record("topic", &record.local_id).unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);

        scheduler.handle().trigger();
        wait_for_cycle(&mut events).await;
        assert_eq!(scheduler.shutdown(Duration::from_secs(1)).await, ShutdownOutcome::Clean);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn saves_are_pushed_right_away() {
        let remote = LoopbackRemote::standalone();
        let manager = manager(&remote);
        let mut events = manager.subscribe();
        let scheduler = Scheduler::start(Arc::clone(&manager), quiet_config(true));
        wait_for_cycle(&mut events).await;

        let record = manager
            .store()
            .create_record("topic", &json!({"title": "saved"}))
            .unwrap();
        let store = manager.store().clone();
        eventually(|| {
            store
                .get_record("topic", &record.local_id)
                .unwrap()
                .is_some_and(|row| row.sync_status == SyncStatus::Synced)
        })
        .await;
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notifications_pull_after_debounce() {
        let remote_a = LoopbackRemote::standalone();
        let remote_b = LoopbackRemote::new(Arc::clone(remote_a.authority()));
        let client_a = manager(&remote_a);
        let client_b = manager(&remote_b);

        let mut events = client_b.subscribe();
        let scheduler = Scheduler::start(Arc::clone(&client_b), quiet_config(false));
        wait_for_cycle(&mut events).await;

        client_a
            .store()
            .create_record("topic", &json!({"title": "from a"}))
            .unwrap();
        client_a.run_cycle().await.unwrap();

        let handle = scheduler.handle();
        handle.request_pull("topic");
        handle.request_pull("topic");
        handle.request_pull("habit");

        let store = client_b.store().clone();
        eventually(|| store.list_records("topic", 10, 0, false).unwrap().len() == 1).await;
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notification_stream_cannot_postpone_pull_forever() {
        let remote_a = LoopbackRemote::standalone();
        let remote_b = LoopbackRemote::new(Arc::clone(remote_a.authority()));
        let client_a = manager(&remote_a);
        let client_b = manager(&remote_b);

        let mut events = client_b.subscribe();
        let config = SchedulerConfig {
            debounce: Duration::from_millis(100),
            ..quiet_config(false)
        };
        let scheduler = Scheduler::start(Arc::clone(&client_b), config);
        wait_for_cycle(&mut events).await;

        client_a
            .store()
            .create_record("topic", &json!({"title": "from a"}))
            .unwrap();
        client_a.run_cycle().await.unwrap();

        // Requests every 25ms keep resetting the debounce; the cap is 400ms
        let handle = scheduler.handle();
        let store = client_b.store().clone();
        let started = Instant::now();
        let mut pulled = false;
        while started.elapsed() < Duration::from_secs(3) {
            handle.request_pull("topic");
            tokio::time::sleep(Duration::from_millis(25)).await;
            if store.list_records("topic", 10, 0, false).unwrap().len() == 1 {
                pulled = true;
                break;
            }
        }
        assert!(pulled);
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn pull_deadline_is_capped_from_first_request() {
        let (_handle, commands) = SchedulerHandle::detached();
        let remote = LoopbackRemote::standalone();
        let (_shutdown, shutdown_rx) = watch::channel(false);
        let debounce = Duration::from_millis(100);
        let mut worker = Worker {
            manager: manager(&remote),
            config: SchedulerConfig {
                debounce,
                ..quiet_config(false)
            },
            commands,
            shutdown: shutdown_rx,
            changes: None,
            pending_pulls: BTreeSet::new(),
            pull_deadline: None,
            pull_requested_at: None,
        };

        let first = Instant::now();
        worker.schedule_pull(first);
        assert_eq!(worker.pull_deadline, Some(first + debounce));

        worker.schedule_pull(first + debounce * 2);
        assert_eq!(worker.pull_deadline, Some(first + debounce * 3));

        worker.schedule_pull(first + debounce * 10);
        assert_eq!(
            worker.pull_deadline,
            Some(first + debounce * MAX_PULL_DELAY_FACTOR)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_gives_up_after_timeout() {
        let remote = LoopbackRemote::standalone();
        let manager = manager(&remote);
        manager
            .store()
            .create_record("topic", &json!({"title": "stuck"}))
            .unwrap();
        remote.hold_requests();

        let scheduler = Scheduler::start(Arc::clone(&manager), quiet_config(false));
        remote.wait_for_requests(1).await;

        let outcome = scheduler.shutdown(Duration::from_millis(50)).await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut);
        remote.release_requests();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_outlives_worker_quietly() {
        let remote = LoopbackRemote::standalone();
        let scheduler = Scheduler::start(manager(&remote), quiet_config(false));
        let handle = scheduler.handle();
        scheduler.shutdown(Duration::from_secs(1)).await;
        handle.trigger();
        handle.request_pull("topic");
    }

    #[test]
    fn detached_handle_queues_commands() {
        let (handle, mut commands) = SchedulerHandle::detached();
        handle.request_pull("topic");
        assert_eq!(
            commands.try_recv().unwrap(),
            Command::Pull {
                entity_type: "topic".into()
            }
        );
    }
}
