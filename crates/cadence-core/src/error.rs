use serde::{Deserialize, Serialize};
use std::fmt;

/// Convenience alias used across all Cadence crates.
pub type CadenceResult<T> = Result<T, CadenceError>;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// The same operation may succeed later (timeouts, contention, rate limits).
    Transient,
    /// Retrying cannot help (bad input, merge conflict, missing branch).
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "TRANSIENT"),
            ErrorClass::Permanent => write!(f, "PERMANENT"),
        }
    }
}

// --- Sub-errors ---

/// An illegal state-machine edge. Always a programming error or a race.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid {entity} transition: {from} -> {to}")]
pub struct TransitionError {
    /// `"job"` or `"task"`.
    pub entity: &'static str,
    /// Current status.
    pub from: String,
    /// Requested status.
    pub to: String,
}

/// Failures reported by a state store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The record does not exist. A normal negative result on lookup.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same key was already created.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The backing medium failed.
    #[error("store I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// True for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Io(format!("corrupt record: {err}"))
    }
}

/// A git failure, tagged with its retry class at the call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct GitError {
    /// Human readable description, usually including git's stderr.
    pub message: String,
    /// Whether the operation may succeed on retry.
    pub class: ErrorClass,
}

impl GitError {
    /// A failure that may clear up on its own.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: ErrorClass::Transient,
        }
    }

    /// A failure that will not clear up by retrying.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            class: ErrorClass::Permanent,
        }
    }
}

/// The develop lock is held by someone else (or could not be taken).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct LockError(pub String);

/// Malformed worker output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ParseError(pub String);

// --- Umbrella error ---

/// Top-level error type for the Cadence engine.
#[derive(Debug, thiserror::Error)]
pub enum CadenceError {
    /// An illegal job or task transition.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// A state-store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A git command failed.
    #[error("Git error: {0}")]
    Git(#[from] GitError),

    /// The develop lock could not be acquired.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Worker output could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// A caller asked for something the current state does not allow.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error raised by the control loop itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Raw I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CadenceError {
    /// Retry class implied by the error's type.
    ///
    /// Lock contention and store I/O are transient; git errors carry their own
    /// class; everything else is permanent.
    pub fn error_class(&self) -> ErrorClass {
        match self {
            CadenceError::Lock(_) | CadenceError::Io(_) => ErrorClass::Transient,
            CadenceError::Store(StoreError::Io(_)) => ErrorClass::Transient,
            CadenceError::Git(err) => err.class,
            _ => ErrorClass::Permanent,
        }
    }

    /// True when the error is a store NOT_FOUND.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CadenceError::Store(err) if err.is_not_found())
    }
}
