//! The Cadence control loop and the components it drives.
//!
//! A job moves through the spec, impl and test phases. For each phase the
//! [`Orchestrator`] plans tasks, hands them to a [`WorkerBackend`], waits for
//! the [`TaskWatcher`] to collect every result, gates and aggregates the
//! reports, waits for a human decision and finally commits the phase artifact
//! to the develop branch.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Tick-driven state machine over job status.
//! - [`JobService`]: Create, cancel, approve and reject operations for outer surfaces.
//! - [`Scheduler`]: Admission control bounded by `max_jobs`.
//! - [`RetryManager`]: Error classification and exponential backoff.
//! - [`QualityGate`] / [`Aggregator`]: Phase acceptance and report merging.
//! - [`EventBus`]: Typed, pattern-filtered event fan-out with idempotent emission.

/// Report merging and contradiction detection.
pub mod aggregator;
/// Worker execution backends.
pub mod backend;
/// In-process event bus.
pub mod bus;
/// Library-level configuration structs.
pub mod config;
/// The control loop.
pub mod engine;
/// Host resource estimation for `max_jobs`.
pub mod estimator;
/// Event payloads.
pub mod events;
/// Phase quality gate.
pub mod gate;
/// Persisted transitions with trace and event side effects.
pub mod ledger;
/// Worker output parsing.
pub mod parser;
/// Task templates per phase.
pub mod planner;
/// Retry classification and backoff.
pub mod retry;
/// Job admission.
pub mod scheduler;
/// Job lifecycle operations.
pub mod service;
/// Sentinel file watching.
pub mod watcher;

pub use aggregator::{AggregatedResult, Aggregator, ClaimSimilarity, LexicalOverlap};
pub use backend::{CommandBackend, TaskBrief, WorkerBackend};
pub use bus::{EventBus, Subscription};
pub use config::{
    EstimationConfig, GitConfig, OrchestratorConfig, RetryConfig, WatcherConfig, WorkerConfig,
};
pub use engine::Orchestrator;
pub use estimator::{estimate_max_jobs, MaxJobs, SystemResources};
pub use events::{Event, EventKind};
pub use gate::{GateResult, QualityGate};
pub use ledger::Ledger;
pub use parser::{parse_worker_output, report_from_output, WorkerOutput};
pub use planner::PhasePlanner;
pub use retry::{classify_error, RetryDecision, RetryManager};
pub use scheduler::Scheduler;
pub use service::{JobDashboard, JobService, RetryStatus};
pub use watcher::TaskWatcher;
