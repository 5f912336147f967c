//! # Repository Module
//!
//! Database repository implementations for the pipeline store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repositories                                         │
//! │                                                                         │
//! │  Worker (tally-sync)                                                   │
//! │       │                                                                 │
//! │       │  db.queue().drain_batch(Table::Events, "abc", false, 50)       │
//! │       ▼                                                                 │
//! │  QueueRepository                                                       │
//! │  ├── add_record(table, token, data, automatic)                         │
//! │  ├── drain_batch(table, token, include_automatic, limit)               │
//! │  ├── delete_up_to(watermark, table, token, include_automatic)          │
//! │  ├── purge_older_than(cutoff, table)                                   │
//! │  └── delete_all()                                                      │
//! │                                                                         │
//! │  SequenceRepository                                                    │
//! │  ├── load(token)                                                       │
//! │  └── store(token, next_value)                                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`queue::QueueRepository`] - events / people queues
//! - [`sequence::SequenceRepository`] - per-token sequence numbers

pub mod queue;
pub mod sequence;
