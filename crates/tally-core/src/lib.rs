//! # tally-core: Pure Types for the Tally Pipeline
//!
//! This crate holds the data model shared by the storage layer and the
//! delivery engine. Everything here is deterministic and free of I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Tally Architecture                              │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Producer threads (host application)                │   │
//! │  │     enqueue_event ──► enqueue_profile_update ──► request_flush  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ Dispatcher (tally-sync)                │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌──────────┐ │   │
//! │  │   │   types    │  │  backoff   │  │  decision  │  │  error   │ │   │
//! │  │   │ EventDesc  │  │ RetryState │  │ RemoteCfg  │  │CoreError │ │   │
//! │  │   │ WireEvent  │  │ FlushFreq  │  │ Decision   │  │          │ │   │
//! │  │   └────────────┘  └────────────┘  └────────────┘  └──────────┘ │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (Database Layer)                    │   │
//! │  │            events / people queues, sequence numbers             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Event/profile descriptions, tables, wire records, batches
//! - [`decision`] - Remote config decisions
//! - [`backoff`] - Delivery backoff schedule, retry state, flush frequency
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use serde_json::{json, Map};
//! use tally_core::types::EventDescription;
//!
//! let mut props = Map::new();
//! props.insert("time".into(), json!(1000));
//!
//! let event = EventDescription::new("Button Clicked", props, "abc", false);
//! let wire = event.to_wire(0).unwrap();
//!
//! assert_eq!(wire.event, "button_clicked");
//! assert_eq!(wire.ts, 1000);
//! assert_eq!(wire.payload["seq_no"], json!(0));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backoff;
pub mod decision;
pub mod error;
pub mod types;

// =============================================================================
// Re-exports
// =============================================================================

pub use backoff::{delivery_backoff, FlushFrequency, RetryState, BACKOFF_BASE, MAX_BACKOFF};
pub use decision::RemoteConfigDecision;
pub use error::{CoreError, CoreResult};
pub use types::{
    normalize_event_name, EventDescription, FlushRequest, PersistedBatch, ProfileUpdate, Table,
    WireEvent,
};
