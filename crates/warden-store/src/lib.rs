//! Durable task state for the warden orchestration core.
//!
//! The crate defines the task data model, the [`TaskStore`] persistence
//! contract (per-priority FIFO queues, status-indexed records, dead-letter
//! queue), and two backends: [`memory::MemoryTaskStore`] for single-process
//! deployments and tests, and [`postgres::PostgresTaskStore`] for
//! distributed deployments where operator tooling and the dispatcher share
//! one database.

pub mod config;
pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod store;

pub use error::StoreError;
pub use memory::MemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{apply_transition, ScanOrder, TaskStore, TransitionFields};
