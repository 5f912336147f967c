//! # tally-sync: Ingestion and Delivery Engine
//!
//! This crate turns producer calls into durable, ordered, retried uploads.
//! One worker task owns every piece of mutable state; producers only ever
//! touch a cloneable [`Dispatcher`].
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Delivery Engine                            │
//! │                                                                         │
//! │  producer threads                                                       │
//! │    │  enqueue_event / enqueue_profile_update / request_flush           │
//! │    ▼                                                                    │
//! │  ┌────────────────┐   unbounded mpsc   ┌────────────────────────────┐  │
//! │  │   Dispatcher   │ ─────────────────► │          Worker            │  │
//! │  │ (Clone, never  │   Command, FIFO    │                            │  │
//! │  │  blocks)       │                    │ SequenceGenerator          │  │
//! │  └────────────────┘                    │ RetryState + timers        │  │
//! │          ▲                             │ RemoteConfigChecker        │  │
//! │          │ WorkerStatus (RwLock)       └─────────────┬──────────────┘  │
//! │          └───────────────────────────────────────────┤                 │
//! │                                                      ▼                  │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │  RecordStore   │  │ DeliveryPipe-  │  │  RemoteService         │    │
//! │  │                │◄─│ line           │─►│                        │    │
//! │  │ SQLite (sqlx)  │  │ drain → POST → │  │ HttpService (reqwest)  │    │
//! │  │ or in-memory   │  │ delete         │  │ primary + fallbacks    │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`dispatcher`] - Producer handle and `WorkerBuilder`
//! - [`worker`] - The actor: command handling, timers, fault policy
//! - [`delivery`] - Drain/send/delete loop with endpoint fallback
//! - [`remote_config`] - Per-token decisions gating automatic events
//! - [`sequence`] - Durable per-token sequence numbers
//! - [`store`] - Record store trait, SQLite and in-memory implementations
//! - [`transport`] - Network seam and the reqwest implementation
//! - [`protocol`] - Mailbox command types
//! - [`config`] - TOML + environment configuration
//! - [`error`] - Engine error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//! use tally_sync::{TallyConfig, WorkerBuilder};
//!
//! let config = TallyConfig::load(None)?;
//! let db = Database::new(DbConfig::new(config.database_path())).await?;
//!
//! let dispatcher = WorkerBuilder::new(config).with_database(db).spawn()?;
//! dispatcher.enqueue_event("Button Clicked", props, "abc", false);
//! dispatcher.request_flush("abc", true);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod remote_config;
pub mod sequence;
pub mod store;
pub mod transport;
pub mod worker;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{ClientSettings, DeliverySettings, StorageSettings, TallyConfig};
pub use delivery::{DeliveryFailure, DeliveryPipeline, DeliveryReport};
pub use dispatcher::{Dispatcher, WorkerBuilder};
pub use error::{SyncError, SyncResult};
pub use protocol::Command;
pub use remote_config::{CachedDecision, RemoteConfigCheck, RemoteConfigChecker, RemoteConfigSource};
pub use sequence::{MemorySequenceStore, SequenceGenerator, SequenceStore, SqliteSequenceStore};
pub use store::{AddOutcome, MemoryStore, RecordStore, SqliteRecordStore};
pub use transport::{HttpService, OfflineMode, OfflineSwitch, RemoteResponse, RemoteService};
pub use worker::{WorkerState, WorkerStatus};

pub use tally_core::{RemoteConfigDecision, Table};
