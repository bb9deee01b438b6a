//! `warden-memory` – Durable State
//!
//! SQLite persistence for tasks, their steps and the long-term memory that
//! carries lessons and operator preferences from one task to the next.
//!
//! # Modules
//!
//! - [`task_store`] – [`SqliteTaskStore`][task_store::SqliteTaskStore]: the
//!   [`TaskStore`][warden_runtime::TaskStore] the CLI runs on. Task state,
//!   including any checkpoint, is stored as JSON next to indexed columns.
//! - [`memory_store`] – [`SqliteMemoryStore`][memory_store::SqliteMemoryStore]:
//!   the [`MemoryCapability`][warden_runtime::MemoryCapability] with
//!   keyword-overlap retrieval and lesson extraction.
//! - [`error`] – [`StoreError`][error::StoreError] and its conversion into
//!   [`WardenError`][warden_types::WardenError].

pub mod error;
pub mod memory_store;
pub mod task_store;

pub use error::StoreError;
pub use memory_store::{MemoryEntry, SqliteMemoryStore};
pub use task_store::SqliteTaskStore;
