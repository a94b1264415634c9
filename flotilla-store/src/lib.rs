//! flotilla-store: pluggable persistence for orchestrator state.
//!
//! The contract is a flat byte store keyed by (namespace, id). Backends must
//! be crash-safe and linearizable per key; the shipped implementations are an
//! in-memory map (tests, dry runs) and an atomic-rename file store.

use thiserror::Error;

pub mod file;
pub mod memory;
pub mod persist;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Persisted-state layout. Audit keys are zero-padded sequence numbers so
/// lexicographic listing is chronological.
pub mod namespace {
    pub const TENANTS: &str = "tenants";
    pub const NODES: &str = "nodes";
    pub const JOBS: &str = "jobs";
    pub const CHECKPOINTS: &str = "checkpoints";
    pub const AUDIT: &str = "audit";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{namespace}/{id} not found")]
    NotFound { namespace: String, id: String },

    #[error("transient i/o error: {0}")]
    Io(String),

    #[error("corrupt record {namespace}/{id}: {reason}")]
    Corrupt { namespace: String, id: String, reason: String },
}

impl StoreError {
    pub fn retriable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

pub trait Store: Send {
    fn put(&mut self, namespace: &str, id: &str, bytes: &[u8]) -> Result<(), StoreError>;
    fn get(&self, namespace: &str, id: &str) -> Result<Vec<u8>, StoreError>;
    /// Ids present in a namespace, sorted ascending.
    fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError>;
    fn delete(&mut self, namespace: &str, id: &str) -> Result<(), StoreError>;
}

/// Retry a transient-failing operation with exponential backoff. Non-I/O
/// errors surface immediately.
pub fn with_retry<T>(
    attempts: u32,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut delay = std::time::Duration::from_millis(50);
    let mut last = None;
    for attempt in 0..attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.retriable() => {
                tracing::debug!(target: "flotilla::store", attempt, error = %err, "retrying");
                last = Some(err);
                std::thread::sleep(delay);
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| StoreError::Io("retry budget exhausted".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let result = with_retry(5, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StoreError::Io("flaky".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_does_not_touch_permanent_errors() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = with_retry(5, || {
            calls.set(calls.get() + 1);
            Err(StoreError::NotFound { namespace: "jobs".to_string(), id: "j1".to_string() })
        });
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_gives_up_after_budget() {
        let result: Result<(), _> = with_retry(3, || Err(StoreError::Io("down".to_string())));
        assert!(matches!(result, Err(StoreError::Io(_))));
    }
}
