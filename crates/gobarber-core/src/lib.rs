//! Core library for GoBarber clients.
//!
//! Holds the signed-in user's session, persists it to device storage and
//! exposes sign-in/sign-out to the rest of the application:
//! - `api`: HTTP client for the GoBarber authentication endpoint
//! - `storage`: batched key-value persistence (file-backed or in-memory)
//! - `auth`: `SessionStore` and the task-scoped `SessionProvider`
//! - `config`: application configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod storage;

pub use api::{ApiClient, ApiError, AuthApi};
pub use auth::{
    try_use_session, use_session, RestoreOutcome, Session, SessionError, SessionProvider,
    SessionState, SessionStore, SignInCredentials, User,
};
pub use config::Config;
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError, StorageKeys};
