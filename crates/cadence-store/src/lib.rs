//! Durable state for the Cadence engine.
//!
//! The [`StateStore`] trait is the only way the orchestrator reads or writes
//! jobs, tasks, reports and trace entries. Two implementations ship:
//!
//! - [`FileStateStore`]: one JSON file per record, written to a temp file and
//!   renamed into place, plus an append-only JSONL trace log per job.
//! - [`MemoryStateStore`]: in-process maps, used by tests and dry runs.
//!
//! Records are handed out as owned copies; the only way to change stored
//! state is an explicit `update_*` call.

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use store::{JobFilter, StateStore, StoreResult};
