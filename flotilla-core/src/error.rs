//! Error taxonomy shared across the orchestrator.
//!
//! Failure kinds map onto how callers should react: validation and invariant
//! errors are surfaced synchronously, transient errors may be retried, and
//! domain failures never travel this path at all (they are observed by the
//! failure detector and drive the recovery pipeline instead).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Invariant,
    Transient,
    Backend,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Validation(_) => ErrorKind::Validation,
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::Invariant(_) => ErrorKind::Invariant,
            OrchestratorError::Transient(_) => ErrorKind::Transient,
            OrchestratorError::Backend(_) => ErrorKind::Backend,
            OrchestratorError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn retriable(&self) -> bool {
        matches!(self, OrchestratorError::Transient(_))
    }
}

impl From<RegistryError> for OrchestratorError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { .. } => OrchestratorError::NotFound(err.to_string()),
            RegistryError::DuplicateId { .. } => OrchestratorError::Validation(err.to_string()),
            RegistryError::IllegalTransition { .. } | RegistryError::InvariantViolation(_) => {
                OrchestratorError::Invariant(err.to_string())
            }
        }
    }
}

/// Structured command outcome surfaced by external adapters.
#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum CommandResult<T: Serialize> {
    Ok { value: T },
    Error { kind: ErrorKind, message: String, retriable: bool },
}

impl<T: Serialize> CommandResult<T> {
    pub fn from_result(res: Result<T, OrchestratorError>) -> Self {
        match res {
            Ok(value) => CommandResult::Ok { value },
            Err(err) => CommandResult::Error {
                kind: err.kind(),
                message: err.to_string(),
                retriable: err.retriable(),
            },
        }
    }
}
