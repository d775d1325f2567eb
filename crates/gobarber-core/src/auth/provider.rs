use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;

use super::{SessionError, SessionStore};

tokio::task_local! {
    static CURRENT_SESSION: Arc<SessionStore>;
}

/// Makes a `SessionStore` available to everything running inside a scope.
///
/// The context is task-local: work spawned onto other tasks must go through
/// [`SessionProvider::spawn`] to keep seeing it.
pub struct SessionProvider;

impl SessionProvider {
    /// Run `future` with `store` as the current session context.
    pub async fn scope<F>(store: Arc<SessionStore>, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_SESSION.scope(store, future).await
    }

    /// Spawn `future` onto the runtime with the current session context.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a provider scope.
    pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let store = use_session();
        tokio::spawn(CURRENT_SESSION.scope(store, future))
    }
}

/// The session store of the enclosing [`SessionProvider`] scope.
///
/// # Panics
///
/// Panics when called outside of a provider scope.
pub fn use_session() -> Arc<SessionStore> {
    match try_use_session() {
        Ok(store) => store,
        Err(_) => panic!("use_session must be used within a SessionProvider"),
    }
}

/// Like [`use_session`], but returns `SessionError::OutsideProvider` instead of panicking.
pub fn try_use_session() -> Result<Arc<SessionStore>, SessionError> {
    CURRENT_SESSION
        .try_with(Arc::clone)
        .map_err(|_| SessionError::OutsideProvider)
}
