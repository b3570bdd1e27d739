//! Error types for the reconciler crate.

use thiserror::Error;

use crate::types::ResourceKind;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a [`TaskStore`](crate::store::TaskStore) backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: ResourceKind, key: String },

    /// The write was based on a stale resource version.
    #[error("conflict writing '{key}': expected version {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// An object with the same key already exists.
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: ResourceKind, key: String },

    /// Any other backend failure.
    #[error("store backend error: {reason}")]
    Backend { reason: String },
}

impl StoreError {
    /// Create a not found error.
    pub fn not_found(kind: ResourceKind, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: ResourceKind, key: impl ToString) -> Self {
        Self::AlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    /// Create a backend error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Whether the object was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the object already existed.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Whether the write lost an optimistic-concurrency race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Reconciler error types.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The schedule string is not a valid `YYYY-MM-DDTHH:MM:SSZ` timestamp.
    #[error("invalid schedule '{schedule}': {reason}")]
    ScheduleParse { schedule: String, reason: String },

    /// A store read or write failed.
    #[error("store operation '{operation}' failed: {source}")]
    Store {
        operation: String,
        #[source]
        source: StoreError,
    },

    /// Creating the execution unit failed.
    #[error("failed to create execution unit '{name}': {source}")]
    UnitCreate {
        name: String,
        #[source]
        source: StoreError,
    },

    /// The owner reference could not be attached.
    #[error("owner reference error: {reason}")]
    OwnerReference { reason: String },

    /// Invalid configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// The controller was stopped.
    #[error("controller stopped")]
    ControllerStopped,
}

impl Error {
    /// Create a schedule parse error.
    pub fn schedule_parse(schedule: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ScheduleParse {
            schedule: schedule.into(),
            reason: reason.into(),
        }
    }

    /// Create a store error.
    pub fn store(operation: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            operation: operation.into(),
            source,
        }
    }

    /// Create a unit create error.
    pub fn unit_create(name: impl Into<String>, source: StoreError) -> Self {
        Self::UnitCreate {
            name: name.into(),
            source,
        }
    }

    /// Create an owner reference error.
    pub fn owner_reference(reason: impl Into<String>) -> Self {
        Self::OwnerReference {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_error_display() {
        let err = Error::schedule_parse("tomorrow", "premature end of input");
        assert!(err.to_string().contains("tomorrow"));
        assert!(err.to_string().contains("premature end of input"));
    }

    #[test]
    fn test_store_error_wrapping() {
        let err = Error::store(
            "update_status",
            StoreError::not_found(ResourceKind::ScheduledTask, "default/at"),
        );
        let text = err.to_string();
        assert!(text.contains("update_status"));
        assert!(text.contains("default/at"));
    }

    #[test]
    fn test_store_error_predicates() {
        assert!(StoreError::not_found(ResourceKind::ExecutionUnit, "a/b").is_not_found());
        assert!(StoreError::already_exists(ResourceKind::ExecutionUnit, "a/b").is_already_exists());
        assert!(!StoreError::backend("disk full").is_not_found());
    }
}
