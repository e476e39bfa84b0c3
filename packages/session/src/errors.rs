//! Error types for the session layer

use crate::constraints::Permission;
use crate::state::ItemStatus;
use arbor_spi::{FailureKind, ItemId, Name, StoreError};
use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

/// Error taxonomy exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    IllegalStateTransition,
    ConstraintViolation,
    LockConflict,
    VersionConflict,
    AccessDenied,
    UnsupportedOperation,
    StaleState,
    BatchFailure,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Item not found: {0}")]
    NotFound(ItemId),

    #[error("Item '{name}' already exists under {parent}")]
    AlreadyExists { parent: ItemId, name: Name },

    #[error("Illegal state transition for {id}: {from:?} -> {to:?}")]
    IllegalStateTransition {
        id: ItemId,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("A save is in progress; the session cannot be modified")]
    SaveInProgress,

    #[error("Constraint violation on {id}: {message}")]
    ConstraintViolation { id: ItemId, message: String },

    #[error("Node {0} is locked by another session")]
    LockConflict(ItemId),

    #[error("Node {0} is checked in")]
    VersionConflict(ItemId),

    #[error("Access denied: {permission:?} on {id}")]
    AccessDenied { id: ItemId, permission: Permission },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Item {0} changed or vanished in the remote store")]
    StaleState(ItemId),

    #[error("Batch rejected at instruction {index} ({kind:?}): {message}")]
    BatchRejected {
        index: usize,
        kind: FailureKind,
        message: String,
    },

    #[error("Batch outcome unknown: {0}")]
    BatchOutcomeUnknown(String),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            SessionError::IllegalStateTransition { .. } | SessionError::SaveInProgress => {
                ErrorKind::IllegalStateTransition
            }
            SessionError::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            SessionError::LockConflict(_) => ErrorKind::LockConflict,
            SessionError::VersionConflict(_) => ErrorKind::VersionConflict,
            SessionError::AccessDenied { .. } => ErrorKind::AccessDenied,
            SessionError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            SessionError::StaleState(_) => ErrorKind::StaleState,
            SessionError::BatchRejected { .. }
            | SessionError::BatchOutcomeUnknown(_)
            | SessionError::Store(_) => ErrorKind::BatchFailure,
        }
    }

    /// The kind the remote store reported, for rejected batches
    pub fn reported_kind(&self) -> Option<FailureKind> {
        match self {
            SessionError::BatchRejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub(crate) fn constraint(id: &ItemId, message: impl Into<String>) -> Self {
        SessionError::ConstraintViolation {
            id: id.clone(),
            message: message.into(),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => SessionError::NotFound(id),
            StoreError::OutcomeUnknown(reason) => SessionError::BatchOutcomeUnknown(reason),
            other => SessionError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_kinds() {
        let missing: SessionError = StoreError::NotFound(ItemId::new("item-1")).into();
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let lost: SessionError = StoreError::OutcomeUnknown("timeout".into()).into();
        assert_eq!(lost.kind(), ErrorKind::BatchFailure);

        let down: SessionError = StoreError::Unavailable("down".into()).into();
        assert_eq!(down.kind(), ErrorKind::BatchFailure);
    }

    #[test]
    fn test_save_in_progress_is_a_transition_error() {
        assert_eq!(
            SessionError::SaveInProgress.kind(),
            ErrorKind::IllegalStateTransition
        );
    }

    #[test]
    fn test_rejected_batch_keeps_reported_kind() {
        let err = SessionError::BatchRejected {
            index: 2,
            kind: FailureKind::VersionConflict,
            message: "checked in".into(),
        };
        assert_eq!(err.kind(), ErrorKind::BatchFailure);
        assert_eq!(err.reported_kind(), Some(FailureKind::VersionConflict));
    }
}
