//! # Dispatcher
//!
//! The producer-facing handle for one worker, and the builder that spawns it.
//!
//! ## Handle Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Dispatcher (Clone)                               │
//! │                                                                         │
//! │  Arc<Mutex<Option<UnboundedSender<Command>>>>   ◄── Weak held by worker│
//! │       │                                                                 │
//! │       │  Some(tx): post() hands the command to the mailbox              │
//! │       │  None:     worker is dead, command dropped and logged           │
//! │       │                                                                 │
//! │  Arc<RwLock<WorkerStatus>>                     ◄── written by worker   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Posting never blocks and never fails loudly. Callers that care can ask
//! [`Dispatcher::is_dead`].

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use tally_core::{EventDescription, FlushRequest, ProfileUpdate};
use tally_db::Database;

use crate::config::TallyConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::Command;
use crate::remote_config::{RemoteConfigCheck, RemoteConfigSource};
use crate::sequence::{MemorySequenceStore, SequenceStore, SqliteSequenceStore};
use crate::store::{RecordStore, SqliteRecordStore};
use crate::transport::{HttpService, OfflineMode, OfflineSwitch, RemoteService};
use crate::worker::{Worker, WorkerParts, WorkerStatus};

/// The mailbox sender, taken by the worker when it dies.
pub(crate) type SenderSlot = Mutex<Option<mpsc::UnboundedSender<Command>>>;

// =============================================================================
// Dispatcher
// =============================================================================

/// Cloneable handle that posts commands to a worker.
#[derive(Clone)]
pub struct Dispatcher {
    slot: Arc<SenderSlot>,
    status: Arc<RwLock<WorkerStatus>>,
}

impl Dispatcher {
    /// Tracks an event for `token`.
    pub fn enqueue_event(
        &self,
        name: impl Into<String>,
        properties: Map<String, Value>,
        token: impl Into<String>,
        automatic: bool,
    ) {
        let event = EventDescription::new(name, properties, token, automatic);
        self.post(Command::EnqueueEvent(event));
    }

    /// Queues a profile update for `token`.
    pub fn enqueue_profile_update(&self, payload: Value, token: impl Into<String>) {
        self.post(Command::EnqueueProfile(ProfileUpdate::new(payload, token)));
    }

    /// Asks the worker to deliver everything queued for `token`.
    pub fn request_flush(&self, token: impl Into<String>, check_remote_config: bool) {
        self.post(Command::Flush(FlushRequest::new(token, check_remote_config)));
    }

    /// Registers a remote config check for its token.
    pub fn install_remote_config_check(&self, check: RemoteConfigCheck) {
        self.post(Command::InstallRemoteConfigCheck(check));
    }

    /// Clears every queued record and stops the worker. Irreversible.
    pub fn terminate(&self) {
        info!("Worker termination requested");
        self.post(Command::Shutdown);
    }

    /// True once the worker can no longer accept commands.
    pub fn is_dead(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map_or(true, |sender| sender.is_closed())
    }

    /// Latest status snapshot published by the worker.
    pub async fn status(&self) -> WorkerStatus {
        self.status.read().await.clone()
    }

    /// Waits until every command posted before this call has been handled.
    ///
    /// Returns `false` if the worker died first.
    pub async fn barrier(&self) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if !self.post(Command::Barrier(done_tx)) {
            return false;
        }
        done_rx.await.is_ok()
    }

    fn post(&self, command: Command) -> bool {
        let kind = command.kind();
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        let Some(sender) = slot.as_ref() else {
            warn!(command = kind, "Worker is dead, dropping command");
            return false;
        };

        match sender.send(command) {
            Ok(()) => true,
            Err(_) => {
                warn!(command = kind, "Worker mailbox closed, dropping command");
                false
            }
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a worker from configuration and optional collaborators.
///
/// ```ignore
/// let dispatcher = WorkerBuilder::new(config)
///     .with_database(db)
///     .spawn()?;
/// dispatcher.enqueue_event("Button Clicked", props, "abc", false);
/// ```
pub struct WorkerBuilder {
    config: TallyConfig,
    database: Option<Database>,
    store: Option<Arc<dyn RecordStore>>,
    sequence_store: Option<Arc<dyn SequenceStore>>,
    remote: Option<Arc<dyn RemoteService>>,
    remote_config_source: Option<Arc<dyn RemoteConfigSource>>,
    offline_mode: Option<Arc<dyn OfflineMode>>,
}

impl WorkerBuilder {
    pub fn new(config: TallyConfig) -> Self {
        WorkerBuilder {
            config,
            database: None,
            store: None,
            sequence_store: None,
            remote: None,
            remote_config_source: None,
            offline_mode: None,
        }
    }

    /// SQLite database backing the queue and sequence numbers unless a
    /// store is given explicitly.
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sequence_store(mut self, store: Arc<dyn SequenceStore>) -> Self {
        self.sequence_store = Some(store);
        self
    }

    /// Replaces the reqwest transport.
    pub fn with_remote_service(mut self, remote: Arc<dyn RemoteService>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_remote_config_source(mut self, source: Arc<dyn RemoteConfigSource>) -> Self {
        self.remote_config_source = Some(source);
        self
    }

    /// Caller-supplied offline override. Without one, `client.offline`
    /// seeds an [`OfflineSwitch`].
    pub fn with_offline_mode(mut self, offline_mode: Arc<dyn OfflineMode>) -> Self {
        self.offline_mode = Some(offline_mode);
        self
    }

    /// Spawns the worker on the current Tokio runtime.
    pub fn spawn(self) -> SyncResult<Dispatcher> {
        self.config.validate()?;

        if self.config.delivery.events_endpoints.is_empty() {
            return Err(SyncError::InvalidConfig(
                "At least one events endpoint is required".into(),
            ));
        }

        let store: Arc<dyn RecordStore> = match (self.store, &self.database) {
            (Some(store), _) => store,
            (None, Some(db)) => Arc::new(
                SqliteRecordStore::new(db, self.config.delivery.batch_size)
                    .with_max_queue_depth(self.config.storage.max_queue_depth),
            ),
            (None, None) => {
                return Err(SyncError::InvalidConfig(
                    "A database or record store is required".into(),
                ))
            }
        };

        let sequence_store: Arc<dyn SequenceStore> = match (self.sequence_store, &self.database) {
            (Some(store), _) => store,
            (None, Some(db)) => Arc::new(SqliteSequenceStore::new(db)),
            (None, None) => {
                debug!("No database given, sequence numbers kept in memory");
                Arc::new(MemorySequenceStore::new())
            }
        };

        let (remote, remote_config_source) = match self.remote {
            Some(remote) => (remote, self.remote_config_source),
            None => {
                let http = Arc::new(HttpService::new(&self.config)?);
                let source = self.remote_config_source.or_else(|| {
                    self.config
                        .delivery
                        .remote_config_endpoint
                        .as_ref()
                        .map(|_| http.clone() as Arc<dyn RemoteConfigSource>)
                });
                (http as Arc<dyn RemoteService>, source)
            }
        };

        let offline_mode = self.offline_mode.unwrap_or_else(|| {
            Arc::new(OfflineSwitch::new(self.config.client.offline)) as Arc<dyn OfflineMode>
        });

        let (sender, mailbox) = mpsc::unbounded_channel();
        let slot = Arc::new(Mutex::new(Some(sender)));
        let status = Arc::new(RwLock::new(WorkerStatus::default()));

        let worker = Worker::new(WorkerParts {
            config: Arc::new(self.config),
            store,
            sequence_store,
            remote,
            remote_config_source,
            offline_mode: Some(offline_mode),
            status: status.clone(),
            mailbox,
            sender_slot: Arc::downgrade(&slot),
        });

        tokio::spawn(worker.run());

        Ok(Dispatcher { slot, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn config() -> TallyConfig {
        let mut config = TallyConfig::default();
        config.delivery.events_endpoints = vec!["http://127.0.0.1:9/track".into()];
        config
    }

    #[tokio::test]
    async fn test_spawn_requires_events_endpoint() {
        let result = WorkerBuilder::new(TallyConfig::default())
            .with_store(Arc::new(MemoryStore::default()))
            .spawn();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_spawn_requires_store() {
        let result = WorkerBuilder::new(config()).spawn();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_terminate_marks_dead() {
        let mut config = config();
        config.client.offline = true;

        let dispatcher = WorkerBuilder::new(config)
            .with_store(Arc::new(MemoryStore::default()))
            .spawn()
            .unwrap();

        assert!(dispatcher.barrier().await);
        assert!(!dispatcher.is_dead());

        dispatcher.terminate();
        assert!(!dispatcher.barrier().await);
        assert!(dispatcher.is_dead());
        assert!(dispatcher.status().await.is_terminated());
    }
}
