//! Git access for the Cadence engine.
//!
//! The develop branch is shared by every job in a repository, possibly across
//! several orchestrator processes. [`DevelopLock`] serializes writers with an
//! OS advisory lock; [`GitOps`] performs the branch, commit and merge steps
//! and always puts the working tree back on the branch it found.

pub mod lock;
pub mod ops;

pub use lock::{DevelopLock, LockGuard, LockHolder, LockOptions};
pub use ops::{ArtifactFile, GitOps};
