//! REST API client module for the GoBarber backend.
//!
//! This module provides the `AuthApi` capability used by the session store
//! and `ApiClient`, its reqwest-backed implementation.
//!
//! Sessions are created by posting credentials to the `sessions` endpoint,
//! which answers with a bearer token and the user's profile.

pub mod client;
pub mod error;

use async_trait::async_trait;
use serde_json::Value;

pub use client::ApiClient;
pub use error::ApiError;

/// Path of the session-creation endpoint, relative to the API base URL.
pub const SESSIONS_PATH: &str = "sessions";

/// JSON-over-HTTP capability the session store authenticates through.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// POST `body` to `path` and return the decoded JSON response.
    /// Transport failures and non-success statuses are errors.
    async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError>;
}
