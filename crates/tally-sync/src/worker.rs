//! # Worker
//!
//! The single task that owns every piece of mutable delivery state.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Worker Lifecycle                               │
//! │                                                                         │
//! │  spawn ──► purge expired records ──► probe blocked hosts               │
//! │                     │                                                   │
//! │                     ▼                                                   │
//! │            ┌─────────────────┐                                          │
//! │            │     Running     │◄──┐                                      │
//! │            └────────┬────────┘   │                                      │
//! │                     │            │                                      │
//! │   select! { biased; │            │                                      │
//! │     due timer ──────┼──► delayed flush ──────────────────┤              │
//! │     mailbox ────────┼──► Enqueue / Flush / Install / ... ┘              │
//! │   }                 │                                                   │
//! │                     │ Shutdown, fault, panic, or every                  │
//! │                     │ dispatcher dropped                                │
//! │                     ▼                                                   │
//! │            ┌─────────────────┐                                          │
//! │            │   Terminated    │  sender taken, later commands dropped    │
//! │            └─────────────────┘                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Post-Enqueue Trigger
//! ```text
//! depth >= bulk_upload_limit  or  store out of memory
//!     │
//!     ├── no backoff pending ──► deliver now (+ remote config check)
//!     │
//!     └── otherwise, depth > 0 and no flush scheduled for the token
//!             └──► schedule flush after flush_interval (if positive)
//! ```
//!
//! ## Retry Timeline (three failures, Retry-After 30 s)
//! ```text
//! t=0     flush ── 500 ──► failures=1, retry in  60 s
//! t=60    flush ── 500 ──► failures=2, retry in 120 s
//! t=180   flush ── 500 ──► failures=3, retry in 240 s
//! t=420   flush ── 200 ──► failures=0, timer cancelled
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use tally_core::{EventDescription, FlushFrequency, FlushRequest, ProfileUpdate, RetryState, Table};

use crate::config::TallyConfig;
use crate::delivery::{DeliveryPipeline, DeliveryReport};
use crate::dispatcher::SenderSlot;
use crate::error::SyncResult;
use crate::protocol::Command;
use crate::remote_config::{RemoteConfigCheck, RemoteConfigChecker, RemoteConfigSource};
use crate::sequence::{SequenceGenerator, SequenceStore};
use crate::store::{AddOutcome, RecordStore};
use crate::transport::{OfflineMode, RemoteService};

// =============================================================================
// Worker Status
// =============================================================================

/// Whether the worker still processes commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Running,
    Terminated,
}

/// Snapshot of the worker's internal state for external queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStatus {
    pub state: WorkerState,

    /// Consecutive failed delivery runs.
    pub failure_count: u32,

    /// Delay chosen after the most recent failure, cleared on success.
    pub last_backoff: Option<Duration>,

    /// Time left before remote config checks may run again.
    pub remote_config_retry_in: Option<Duration>,

    /// Tokens with a delayed flush scheduled, sorted.
    pub pending_flushes: Vec<String>,

    /// Rolling average of the time between flushes. Diagnostic only.
    pub average_flush_interval: Option<Duration>,

    /// Automatic events dropped for lack of an enabling decision.
    pub dropped_automatic_events: u64,

    /// Mailbox commands handled so far.
    pub processed_commands: u64,
}

impl WorkerStatus {
    pub fn is_terminated(&self) -> bool {
        self.state == WorkerState::Terminated
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Collaborators and shared handles the worker is built from.
pub(crate) struct WorkerParts {
    pub config: Arc<TallyConfig>,
    pub store: Arc<dyn RecordStore>,
    pub sequence_store: Arc<dyn SequenceStore>,
    pub remote: Arc<dyn RemoteService>,
    pub remote_config_source: Option<Arc<dyn RemoteConfigSource>>,
    pub offline_mode: Option<Arc<dyn OfflineMode>>,
    pub status: Arc<RwLock<WorkerStatus>>,
    pub mailbox: mpsc::UnboundedReceiver<Command>,
    pub sender_slot: Weak<SenderSlot>,
}

#[derive(Debug, Clone, Copy)]
struct ScheduledFlush {
    deadline: Instant,
    check_remote_config: bool,
}

enum Wake {
    Timer,
    Command(Option<Command>),
}

enum Exit {
    Shutdown,
    MailboxClosed,
}

pub(crate) struct Worker {
    config: Arc<TallyConfig>,
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteService>,
    sequence: SequenceGenerator,
    pipeline: DeliveryPipeline,
    checker: RemoteConfigChecker,

    retry: RetryState,
    remote_config_retry_after: Option<Instant>,
    timers: HashMap<String, ScheduledFlush>,
    frequency: FlushFrequency,
    average_flush_interval: Option<Duration>,
    dropped_automatic: u64,
    processed: u64,

    status: Arc<RwLock<WorkerStatus>>,
    mailbox: mpsc::UnboundedReceiver<Command>,
    sender_slot: Weak<SenderSlot>,
}

impl Worker {
    pub(crate) fn new(parts: WorkerParts) -> Self {
        let pipeline = DeliveryPipeline::new(
            parts.store.clone(),
            parts.remote.clone(),
            parts.offline_mode,
        );

        Worker {
            config: parts.config,
            store: parts.store,
            remote: parts.remote,
            sequence: SequenceGenerator::new(parts.sequence_store),
            pipeline,
            checker: RemoteConfigChecker::new(parts.remote_config_source),
            retry: RetryState::new(),
            remote_config_retry_after: None,
            timers: HashMap::new(),
            frequency: FlushFrequency::new(),
            average_flush_interval: None,
            dropped_automatic: 0,
            processed: 0,
            status: parts.status,
            mailbox: parts.mailbox,
            sender_slot: parts.sender_slot,
        }
    }

    /// Runs until shutdown, a fault, or every dispatcher is dropped.
    pub(crate) async fn run(mut self) {
        info!("Worker started");

        let outcome = AssertUnwindSafe(self.run_until_exit()).catch_unwind().await;

        match outcome {
            Ok(Ok(Exit::Shutdown)) => info!("Worker shut down"),
            Ok(Ok(Exit::MailboxClosed)) => info!("All dispatchers dropped, worker stopping"),
            Ok(Err(e)) => error!(error = %e, "Worker fault, terminating"),
            Err(panic) => error!(reason = %panic_message(panic.as_ref()), "Worker panicked, terminating"),
        }

        self.terminate().await;
    }

    async fn run_until_exit(&mut self) -> SyncResult<Exit> {
        self.purge_expired().await;
        self.remote.check_is_blocked().await;
        self.publish_status().await;

        loop {
            let next_deadline = self.timers.values().map(|s| s.deadline).min();

            let wake = tokio::select! {
                biased;

                _ = sleep_until(next_deadline) => Wake::Timer,
                command = self.mailbox.recv() => Wake::Command(command),
            };

            match wake {
                Wake::Timer => {
                    if let Some((token, check_remote_config)) = self.take_due_timer() {
                        debug!(token = %token, "Delayed flush due");
                        self.handle_flush(FlushRequest::new(token, check_remote_config))
                            .await?;
                    }
                }
                Wake::Command(None) => return Ok(Exit::MailboxClosed),
                Wake::Command(Some(command)) => {
                    self.processed += 1;
                    debug!(command = command.kind(), "Processing command");

                    if let Some(exit) = self.handle_command(command).await? {
                        return Ok(exit);
                    }
                }
            }

            self.publish_status().await;
        }
    }

    async fn handle_command(&mut self, command: Command) -> SyncResult<Option<Exit>> {
        match command {
            Command::EnqueueEvent(event) => self.handle_enqueue_event(event).await?,
            Command::EnqueueProfile(update) => self.handle_enqueue_profile(update).await,
            Command::Flush(request) => self.handle_flush(request).await?,
            Command::InstallRemoteConfigCheck(check) => self.handle_install(check).await,
            Command::Barrier(done) => {
                let _ = done.send(());
            }
            Command::Shutdown => {
                info!("Shutdown requested, clearing queued records");
                if let Err(e) = self.store.delete_all().await {
                    warn!(error = %e, "Could not clear queued records");
                }
                return Ok(Some(Exit::Shutdown));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    async fn handle_enqueue_event(&mut self, event: EventDescription) -> SyncResult<()> {
        let seq_no = self.sequence.get_and_increment(&event.token).await?;

        let wire = match event.to_wire(seq_no) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(token = %event.token, error = %e, "Dropping malformed event");
                return Ok(());
            }
        };

        if event.automatic && !self.checker.tracks_automatic(&event.token) {
            self.dropped_automatic += 1;
            debug!(token = %event.token, event = %wire.event, "Automatic events not enabled, dropping");
            return Ok(());
        }

        let record = match wire.to_json_string() {
            Ok(record) => record,
            Err(e) => {
                warn!(token = %event.token, error = %e, "Dropping unserializable event");
                return Ok(());
            }
        };

        match self
            .store
            .add_record(Table::Events, &event.token, &record, event.automatic)
            .await
        {
            Ok(outcome) => self.after_enqueue(&event.token, outcome).await,
            Err(e) => {
                warn!(token = %event.token, error = %e, "Could not persist event");
                Ok(())
            }
        }
    }

    async fn handle_enqueue_profile(&mut self, update: ProfileUpdate) {
        let record = match update.to_record_string() {
            Ok(record) => record,
            Err(e) => {
                warn!(token = %update.token, error = %e, "Dropping malformed profile update");
                return;
            }
        };

        match self
            .store
            .add_record(Table::People, &update.token, &record, false)
            .await
        {
            Ok(outcome) => {
                if let Err(e) = self.after_enqueue(&update.token, outcome).await {
                    warn!(token = %update.token, error = %e, "Immediate delivery failed");
                }
            }
            Err(e) => warn!(token = %update.token, error = %e, "Could not persist profile update"),
        }
    }

    async fn after_enqueue(&mut self, token: &str, outcome: AddOutcome) -> SyncResult<()> {
        let (depth, out_of_memory) = match outcome {
            AddOutcome::Queued(depth) => (depth, false),
            AddOutcome::OutOfMemory => (0, true),
        };

        let bulk = out_of_memory || depth >= self.config.delivery.bulk_upload_limit;

        if bulk && !self.retry.backoff_pending() {
            info!(token = %token, depth, out_of_memory, "Queue limit reached, delivering now");
            return self.handle_flush(FlushRequest::new(token, true)).await;
        }

        if depth > 0 && !self.timers.contains_key(token) {
            if let Some(interval) = self.config.flush_interval() {
                self.schedule_flush(token, interval, true);
            }
        }

        Ok(())
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    async fn handle_flush(&mut self, request: FlushRequest) -> SyncResult<()> {
        let token = request.token.as_str();
        let config = self.config.clone();

        self.record_flush();

        let include_automatic = self.checker.has_resolved_decision(token);
        let events = self
            .pipeline
            .deliver(
                Table::Events,
                token,
                &config.delivery.events_endpoints,
                include_automatic,
            )
            .await;
        self.apply_report(token, &events);

        if !events.offline && !events.failed() && !config.delivery.profile_endpoints.is_empty() {
            let people = self
                .pipeline
                .deliver(Table::People, token, &config.delivery.profile_endpoints, true)
                .await;
            self.apply_report(token, &people);
        }

        if request.check_remote_config {
            self.run_remote_config_check(token).await;
        }

        Ok(())
    }

    fn apply_report(&mut self, token: &str, report: &DeliveryReport) {
        if report.succeeded() {
            self.retry.record_success();
            self.cancel_flush(token);
        }

        if let Some(failure) = report.failure {
            self.cancel_flush(token);
            let delay = self.retry.record_failure(failure.retry_after);
            self.schedule_flush(token, delay, false);
            warn!(
                token = %token,
                failures = self.retry.failures,
                delay_ms = delay.as_millis() as u64,
                "Delivery failed, backing off"
            );
        }
    }

    fn record_flush(&mut self) {
        if let Some(average) = self.frequency.record(Utc::now().timestamp_millis()) {
            debug!(average_secs = average.as_secs(), "Average flush interval");
            self.average_flush_interval = Some(average);
        }
    }

    // =========================================================================
    // Remote Config
    // =========================================================================

    async fn handle_install(&mut self, check: RemoteConfigCheck) {
        let token = check.token().to_string();
        self.checker.install(check);
        self.run_remote_config_check(&token).await;
    }

    async fn run_remote_config_check(&mut self, token: &str) {
        if !self.checker.is_installed(token) {
            return;
        }

        if let Some(deadline) = self.remote_config_retry_after {
            if Instant::now() < deadline {
                debug!(token = %token, "Remote config check deferred by retry-after");
                return;
            }
        }

        if !self.pipeline.is_online().await {
            return;
        }

        if let Err(e) = self.checker.run(token).await {
            if let Some(retry_after) = e.retry_after() {
                warn!(
                    token = %token,
                    retry_after_secs = retry_after.as_secs(),
                    "Remote config unavailable"
                );
                self.remote_config_retry_after = Some(Instant::now() + retry_after);
            }
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn schedule_flush(&mut self, token: &str, delay: Duration, check_remote_config: bool) {
        debug!(token = %token, delay_ms = delay.as_millis() as u64, "Flush scheduled");
        self.timers.insert(
            token.to_string(),
            ScheduledFlush {
                deadline: Instant::now() + delay,
                check_remote_config,
            },
        );
    }

    fn cancel_flush(&mut self, token: &str) {
        self.timers.remove(token);
    }

    fn take_due_timer(&mut self) -> Option<(String, bool)> {
        let now = Instant::now();
        let token = self
            .timers
            .iter()
            .filter(|(_, scheduled)| scheduled.deadline <= now)
            .min_by_key(|(_, scheduled)| scheduled.deadline)
            .map(|(token, _)| token.clone())?;

        let scheduled = self.timers.remove(&token)?;
        Some((token, scheduled.check_remote_config))
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    async fn purge_expired(&self) {
        let expiration = i64::try_from(self.config.data_expiration().as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(expiration);

        for table in Table::ALL {
            if let Err(e) = self.store.purge_older_than(cutoff, table).await {
                warn!(table = %table, error = %e, "Could not purge expired records");
            }
        }
    }

    async fn publish_status(&self) {
        let now = Instant::now();
        let mut pending: Vec<String> = self.timers.keys().cloned().collect();
        pending.sort();

        let mut status = self.status.write().await;
        status.failure_count = self.retry.failures;
        status.last_backoff = self.retry.last_backoff;
        status.remote_config_retry_in = self
            .remote_config_retry_after
            .map(|deadline| deadline.saturating_duration_since(now))
            .filter(|left| !left.is_zero());
        status.pending_flushes = pending;
        status.average_flush_interval = self.average_flush_interval;
        status.dropped_automatic_events = self.dropped_automatic;
        status.processed_commands = self.processed;
    }

    async fn terminate(&mut self) {
        self.timers.clear();
        self.publish_status().await;
        self.status.write().await.state = WorkerState::Terminated;

        if let Some(slot) = self.sender_slot.upgrade() {
            slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
        self.mailbox.close();

        info!("Worker terminated");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
