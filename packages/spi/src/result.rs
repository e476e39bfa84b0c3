use crate::error::StoreError;

/// Result type for remote store calls
pub type StoreResult<T> = Result<T, StoreError>;
