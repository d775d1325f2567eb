//! Authentication module for holding the signed-in user's session.
//!
//! This module provides:
//! - `SessionStore`: the current session, mirrored to a `KeyValueStore`
//! - `SessionProvider` / `use_session`: task-scoped access for consumers
//! - `User`, `Session`, `SignInCredentials`: the data exchanged with the API
//!
//! The session is restored from storage once at startup and written through
//! on every sign-in and sign-out. Tokens never expire client-side.

pub mod error;
pub mod provider;
pub mod session;
pub mod store;

pub use error::SessionError;
pub use provider::{try_use_session, use_session, SessionProvider};
pub use session::{Session, SessionState, SignInCredentials, User};
pub use store::{RestoreOutcome, SessionStore};
