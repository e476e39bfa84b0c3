use crate::ids::ItemId;
use thiserror::Error;

/// Errors reported by a remote store outside of a batch outcome
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Item not found in remote store: {0}")]
    NotFound(ItemId),

    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Batch outcome unknown: {0}")]
    OutcomeUnknown(String),

    #[error("Remote store error: {0}")]
    Generic(String),
}
