use thiserror::Error;

use crate::api::ApiError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Authentication request failed: {0}")]
    Api(#[from] ApiError),

    #[error("Unexpected sessions response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode session data: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Session accessed outside of a SessionProvider")]
    OutsideProvider,
}
