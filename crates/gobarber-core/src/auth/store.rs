//! The session holder shared by the whole application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::{Session, SessionError, SessionState, SignInCredentials, User};
use crate::api::{AuthApi, SESSIONS_PATH};
use crate::storage::{KeyValueStore, StorageError, StorageKeys};

/// Result of the startup restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Both keys were present and the session is active again
    Restored(User),
    /// Nothing was persisted
    Empty,
    /// Persisted state was half-present or unparsable and has been cleared
    Discarded,
    /// `restore` already ran on this store
    AlreadyRestored,
}

enum Persisted {
    Session(Session),
    Empty,
    Invalid(String),
}

/// Holds the current session and mirrors it to a `KeyValueStore`.
///
/// Create one per process with [`SessionStore::start`] and hand it to
/// consumers through a [`SessionProvider`](super::SessionProvider).
pub struct SessionStore {
    api: Arc<dyn AuthApi>,
    storage: Arc<dyn KeyValueStore>,
    keys: StorageKeys,
    state: watch::Sender<SessionState>,
    restored: AtomicBool,
    // Held while persisting and publishing so storage and memory change in the same order.
    commit: Mutex<()>,
}

impl SessionStore {
    /// Create a store in the loading state. Call [`restore`](Self::restore) once.
    pub fn new(
        api: Arc<dyn AuthApi>,
        storage: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::initial());
        Arc::new(Self {
            api,
            storage,
            keys,
            state,
            restored: AtomicBool::new(false),
            commit: Mutex::new(()),
        })
    }

    /// Create a store and restore the persisted session in a background task.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn start(
        api: Arc<dyn AuthApi>,
        storage: Arc<dyn KeyValueStore>,
        keys: StorageKeys,
    ) -> Arc<Self> {
        let store = Self::new(api, storage, keys);
        let restoring = Arc::clone(&store);
        tokio::spawn(async move {
            if let Err(e) = restoring.restore().await {
                warn!(error = %e, "Session restore failed");
            }
        });
        store
    }

    /// Read the persisted session into memory. Runs at most once per store;
    /// `loading` becomes false when it settles, whatever the outcome.
    pub async fn restore(&self) -> Result<RestoreOutcome, SessionError> {
        if self.restored.swap(true, Ordering::SeqCst) {
            return Ok(RestoreOutcome::AlreadyRestored);
        }

        let _commit = self.commit.lock().await;

        let persisted = match self.read_persisted().await {
            Ok(persisted) => persisted,
            Err(e) => {
                self.state.send_modify(|state| state.loading = false);
                return Err(e);
            }
        };

        let outcome = match persisted {
            Persisted::Session(session) => {
                let user = session.user().clone();
                info!(user_id = %user.id, "Session restored");
                self.state.send_modify(|state| {
                    state.session = Some(session);
                    state.loading = false;
                });
                return Ok(RestoreOutcome::Restored(user));
            }
            Persisted::Empty => {
                debug!("No persisted session");
                RestoreOutcome::Empty
            }
            Persisted::Invalid(reason) => {
                warn!(reason = %reason, "Discarding persisted session");
                if let Err(e) = self.storage.multi_remove(&self.keys.all()).await {
                    warn!(error = %e, "Failed to clear persisted session");
                }
                RestoreOutcome::Discarded
            }
        };

        self.state.send_modify(|state| state.loading = false);
        Ok(outcome)
    }

    async fn read_persisted(&self) -> Result<Persisted, SessionError> {
        let values = match self.storage.multi_get(&self.keys.all()).await {
            Ok(values) => values,
            Err(StorageError::Corrupt(e)) => {
                return Ok(Persisted::Invalid(format!("corrupt storage: {}", e)));
            }
            Err(e) => return Err(e.into()),
        };
        let mut values = values
            .into_iter()
            .map(|(_, value)| value.filter(|v| !v.is_empty()));
        let token = values.next().flatten();
        let user = values.next().flatten();

        Ok(match (token, user) {
            (Some(token), Some(user)) => match serde_json::from_str::<User>(&user) {
                Ok(user) => Persisted::Session(Session::new(token, user)),
                Err(e) => Persisted::Invalid(format!("unparsable user: {}", e)),
            },
            (None, None) => Persisted::Empty,
            (Some(_), None) => Persisted::Invalid("token without user".to_string()),
            (None, Some(_)) => Persisted::Invalid("user without token".to_string()),
        })
    }

    /// Authenticate against the sessions endpoint, persist the session, then
    /// make it current. On any failure memory and storage are left untouched.
    pub async fn sign_in(&self, credentials: &SignInCredentials) -> Result<User, SessionError> {
        let body = serde_json::to_value(credentials).map_err(SessionError::Encode)?;
        let response = self.api.post(SESSIONS_PATH, body).await?;
        let session = Session::from_response(response).map_err(SessionError::Decode)?;
        let user_json = serde_json::to_string(session.user()).map_err(SessionError::Encode)?;

        let _commit = self.commit.lock().await;
        self.storage
            .multi_set(&[
                (self.keys.token(), session.token()),
                (self.keys.user(), user_json.as_str()),
            ])
            .await?;

        let user = session.user().clone();
        self.state.send_modify(|state| state.session = Some(session));
        info!(user_id = %user.id, "Signed in");
        Ok(user)
    }

    /// Remove the persisted session, then clear it from memory. Safe to call
    /// when already signed out.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let _commit = self.commit.lock().await;
        self.storage.multi_remove(&self.keys.all()).await?;

        let mut previous = None;
        self.state.send_modify(|state| previous = state.session.take());
        if let Some(user) = previous.as_ref().map(Session::user) {
            info!(user_id = %user.id, "Signed out");
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn user(&self) -> Option<User> {
        self.state.borrow().user().cloned()
    }

    /// Bearer token of the current session
    pub fn token(&self) -> Option<String> {
        self.state.borrow().token().map(str::to_string)
    }

    pub fn loading(&self) -> bool {
        self.state.borrow().loading
    }

    pub fn is_signed_in(&self) -> bool {
        self.state.borrow().is_signed_in()
    }

    /// Receiver notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Stream of snapshots, starting with the current one. Intermediate states
    /// may be skipped by slow consumers; the latest is always delivered.
    pub fn changes(&self) -> impl Stream<Item = SessionState> + Send + 'static {
        stream::unfold((self.state.subscribe(), true), |(mut rx, first)| async move {
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let state = rx.borrow_and_update().clone();
            Some((state, (rx, false)))
        })
    }

    /// Wait for the startup restore to settle and return the resulting state.
    pub async fn wait_until_loaded(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        let loaded = rx.wait_for(|state| !state.loading).await.map(|state| state.clone());
        loaded.unwrap_or_else(|_| self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::storage::{FileStore, MemoryStore};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Notify;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            email: format!("{}@b.com", id),
            name: id.to_uppercase(),
            avatar: String::new(),
        }
    }

    fn response_for(id: &str) -> Value {
        json!({ "token": format!("token-{}", id), "user": user(id) })
    }

    /// Replays canned responses in order.
    #[derive(Default)]
    struct StubApi {
        responses: std::sync::Mutex<VecDeque<Result<Value, ApiError>>>,
    }

    impl StubApi {
        fn with(responses: Vec<Result<Value, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: std::sync::Mutex::new(responses.into()),
            })
        }
    }

    #[async_trait]
    impl AuthApi for StubApi {
        async fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
            assert_eq!(path, "sessions");
            assert!(body.get("email").is_some() && body.get("password").is_some());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ApiError::Unauthorized))
        }
    }

    /// Answers for the user named by the email's local part, optionally
    /// holding a response until its gate is opened.
    #[derive(Default)]
    struct GatedApi {
        gates: HashMap<String, Arc<Notify>>,
    }

    #[async_trait]
    impl AuthApi for GatedApi {
        async fn post(&self, _path: &str, body: Value) -> Result<Value, ApiError> {
            let email = body["email"].as_str().unwrap_or_default().to_string();
            if let Some(gate) = self.gates.get(&email) {
                gate.notified().await;
            }
            let id = email.split('@').next().unwrap_or_default();
            Ok(response_for(id))
        }
    }

    /// Storage whose operations can be made to fail.
    struct BrokenStore {
        inner: MemoryStore,
        fail_reads: bool,
        fail_writes: bool,
    }

    fn io_error() -> StorageError {
        StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn multi_get(&self, keys: &[&str]) -> Result<Vec<(String, Option<String>)>, StorageError> {
            if self.fail_reads {
                return Err(io_error());
            }
            self.inner.multi_get(keys).await
        }

        async fn multi_set(&self, pairs: &[(&str, &str)]) -> Result<(), StorageError> {
            if self.fail_writes {
                return Err(io_error());
            }
            self.inner.multi_set(pairs).await
        }

        async fn multi_remove(&self, keys: &[&str]) -> Result<(), StorageError> {
            if self.fail_writes {
                return Err(io_error());
            }
            self.inner.multi_remove(keys).await
        }
    }

    async fn persisted(storage: &dyn KeyValueStore) -> (Option<String>, Option<String>) {
        let keys = StorageKeys::default();
        let values = storage.multi_get(&keys.all()).await.unwrap();
        (values[0].1.clone(), values[1].1.clone())
    }

    async fn seed(storage: &dyn KeyValueStore, token: &str, user: &str) {
        let keys = StorageKeys::default();
        storage
            .multi_set(&[(keys.token(), token), (keys.user(), user)])
            .await
            .unwrap();
    }

    fn credentials(id: &str) -> SignInCredentials {
        SignInCredentials::new(format!("{}@b.com", id), "secret")
    }

    #[tokio::test]
    async fn test_sign_in_persists_and_publishes() {
        let storage = Arc::new(MemoryStore::new());
        let store = SessionStore::new(
            StubApi::with(vec![Ok(response_for("a"))]),
            storage.clone(),
            StorageKeys::default(),
        );

        let signed_in = store.sign_in(&credentials("a")).await.unwrap();

        assert_eq!(signed_in, user("a"));
        assert_eq!(store.user(), Some(user("a")));
        assert_eq!(store.token().as_deref(), Some("token-a"));
        let (token, user_json) = persisted(&*storage).await;
        assert_eq!(token.as_deref(), Some("token-a"));
        assert_eq!(user_json, Some(serde_json::to_string(&user("a")).unwrap()));
    }

    #[tokio::test]
    async fn test_failed_sign_in_changes_nothing() {
        let storage = Arc::new(MemoryStore::new());
        seed(&*storage, "token-old", &serde_json::to_string(&user("old")).unwrap()).await;
        let store = SessionStore::new(
            StubApi::with(vec![Err(ApiError::Unauthorized)]),
            storage.clone(),
            StorageKeys::default(),
        );
        store.restore().await.unwrap();
        let before = store.state();

        let err = store.sign_in(&credentials("a")).await.unwrap_err();

        assert!(matches!(err, SessionError::Api(ApiError::Unauthorized)));
        assert_eq!(store.state(), before);
        let (token, _) = persisted(&*storage).await;
        assert_eq!(token.as_deref(), Some("token-old"));
    }

    #[tokio::test]
    async fn test_malformed_response_is_decode_error() {
        let storage = Arc::new(MemoryStore::new());
        let store = SessionStore::new(
            StubApi::with(vec![Ok(json!({"token": "abc", "user": {"id": 1}}))]),
            storage.clone(),
            StorageKeys::default(),
        );

        let err = store.sign_in(&credentials("a")).await.unwrap_err();

        assert!(matches!(err, SessionError::Decode(_)));
        assert!(store.user().is_none());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_memory_unchanged() {
        let storage = Arc::new(BrokenStore {
            inner: MemoryStore::new(),
            fail_reads: false,
            fail_writes: true,
        });
        let store = SessionStore::new(
            StubApi::with(vec![Ok(response_for("a"))]),
            storage,
            StorageKeys::default(),
        );

        let err = store.sign_in(&credentials("a")).await.unwrap_err();

        assert!(matches!(err, SessionError::Storage(_)));
        assert!(store.user().is_none());
    }

    #[tokio::test]
    async fn test_sign_out_clears_memory_and_storage() {
        let storage = Arc::new(MemoryStore::new());
        let store = SessionStore::new(
            StubApi::with(vec![Ok(response_for("a"))]),
            storage.clone(),
            StorageKeys::default(),
        );
        store.sign_in(&credentials("a")).await.unwrap();

        store.sign_out().await.unwrap();

        assert!(store.user().is_none());
        assert!(store.token().is_none());
        assert_eq!(persisted(&*storage).await, (None, None));
    }

    #[tokio::test]
    async fn test_sign_out_twice_is_idempotent() {
        let storage = Arc::new(MemoryStore::new());
        let store = SessionStore::new(
            StubApi::with(vec![Ok(response_for("a"))]),
            storage.clone(),
            StorageKeys::default(),
        );
        store.restore().await.unwrap();
        store.sign_in(&credentials("a")).await.unwrap();

        store.sign_out().await.unwrap();
        let once = store.state();
        store.sign_out().await.unwrap();

        assert_eq!(store.state(), once);
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_sign_out_before_restore() {
        let storage = Arc::new(MemoryStore::new());
        seed(&*storage, "abc", &serde_json::to_string(&user("a")).unwrap()).await;
        let store = SessionStore::new(StubApi::with(vec![]), storage.clone(), StorageKeys::default());

        store.sign_out().await.unwrap();

        assert!(store.loading());
        assert!(store.user().is_none());
        assert!(storage.is_empty().await);

        assert_eq!(store.restore().await.unwrap(), RestoreOutcome::Empty);
        assert!(!store.loading());
        assert!(store.user().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_storage_file_does_not_block_sign_in() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStore::new(dir.path()));
        std::fs::write(storage.path(), "{truncated").unwrap();
        let store = SessionStore::new(
            StubApi::with(vec![Ok(response_for("a"))]),
            storage.clone(),
            StorageKeys::default(),
        );

        assert_eq!(store.restore().await.unwrap(), RestoreOutcome::Discarded);
        assert!(!store.loading());
        assert_eq!(persisted(&*storage).await, (None, None));

        store.sign_in(&credentials("a")).await.unwrap();

        let restarted = SessionStore::new(
            StubApi::with(vec![]),
            Arc::new(FileStore::new(dir.path())),
            StorageKeys::default(),
        );
        assert_eq!(restarted.restore().await.unwrap(), RestoreOutcome::Restored(user("a")));

        store.sign_out().await.unwrap();
        assert_eq!(persisted(&*storage).await, (None, None));
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let storage = Arc::new(MemoryStore::new());
        let restored_user = User {
            id: "1".to_string(),
            email: "a@b.com".to_string(),
            name: "A".to_string(),
            avatar: String::new(),
        };
        seed(&*storage, "abc", &serde_json::to_string(&restored_user).unwrap()).await;

        let store = SessionStore::new(StubApi::with(vec![]), storage, StorageKeys::default());
        let outcome = store.restore().await.unwrap();

        assert_eq!(outcome, RestoreOutcome::Restored(restored_user.clone()));
        assert!(!store.loading());
        assert_eq!(store.user(), Some(restored_user));
        assert_eq!(store.token().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_restore_empty_storage() {
        let store = SessionStore::new(
            StubApi::with(vec![]),
            Arc::new(MemoryStore::new()),
            StorageKeys::default(),
        );
        let mut rx = store.subscribe();
        assert!(store.loading());

        assert_eq!(store.restore().await.unwrap(), RestoreOutcome::Empty);

        rx.changed().await.unwrap();
        let state = rx.borrow().clone();
        assert!(!state.loading);
        assert!(state.user().is_none());
    }

    #[tokio::test]
    async fn test_restore_runs_once() {
        let storage = Arc::new(MemoryStore::new());
        let store = SessionStore::new(StubApi::with(vec![]), storage.clone(), StorageKeys::default());
        assert_eq!(store.restore().await.unwrap(), RestoreOutcome::Empty);

        seed(&*storage, "abc", &serde_json::to_string(&user("a")).unwrap()).await;

        assert_eq!(store.restore().await.unwrap(), RestoreOutcome::AlreadyRestored);
        assert!(store.user().is_none());
    }

    #[tokio::test]
    async fn test_restore_discards_corrupt_user() {
        let storage = Arc::new(MemoryStore::new());
        seed(&*storage, "abc", "{not json").await;
        let store = SessionStore::new(StubApi::with(vec![]), storage.clone(), StorageKeys::default());

        assert_eq!(store.restore().await.unwrap(), RestoreOutcome::Discarded);

        assert!(!store.loading());
        assert!(store.user().is_none());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_restore_discards_half_present_session() {
        let storage = Arc::new(MemoryStore::new());
        let keys = StorageKeys::default();
        storage.multi_set(&[(keys.token(), "abc")]).await.unwrap();
        let store = SessionStore::new(StubApi::with(vec![]), storage.clone(), keys);

        assert_eq!(store.restore().await.unwrap(), RestoreOutcome::Discarded);

        assert!(store.user().is_none());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn test_restore_read_failure_still_finishes_loading() {
        let storage = Arc::new(BrokenStore {
            inner: MemoryStore::new(),
            fail_reads: true,
            fail_writes: false,
        });
        let store = SessionStore::new(StubApi::with(vec![]), storage, StorageKeys::default());

        let err = store.restore().await.unwrap_err();

        assert!(matches!(err, SessionError::Storage(StorageError::Io(_))));
        assert!(!store.loading());
        assert!(store.user().is_none());
    }

    #[tokio::test]
    async fn test_start_restores_in_background() {
        let storage = Arc::new(MemoryStore::new());
        seed(&*storage, "abc", &serde_json::to_string(&user("a")).unwrap()).await;

        let store = SessionStore::start(StubApi::with(vec![]), storage, StorageKeys::default());
        let state = store.wait_until_loaded().await;

        assert!(!state.loading);
        assert_eq!(state.user(), Some(&user("a")));
    }

    #[tokio::test]
    async fn test_changes_stream_reports_transitions() {
        let store = SessionStore::new(
            StubApi::with(vec![Ok(response_for("a"))]),
            Arc::new(MemoryStore::new()),
            StorageKeys::default(),
        );
        let mut changes = Box::pin(store.changes());

        let first = changes.next().await.unwrap();
        assert!(first.loading);

        store.restore().await.unwrap();
        let loaded = changes.next().await.unwrap();
        assert!(!loaded.loading);
        assert!(loaded.user().is_none());

        store.sign_in(&credentials("a")).await.unwrap();
        let signed_in = changes.next().await.unwrap();
        assert_eq!(signed_in.user(), Some(&user("a")));

        store.sign_out().await.unwrap();
        let signed_out = changes.next().await.unwrap();
        assert!(signed_out.user().is_none());
        assert!(!signed_out.loading);
    }

    #[tokio::test]
    async fn test_concurrent_sign_ins_last_response_wins() {
        let gate = Arc::new(Notify::new());
        let mut api = GatedApi::default();
        api.gates.insert("a@b.com".to_string(), Arc::clone(&gate));
        let storage = Arc::new(MemoryStore::new());
        let store = SessionStore::new(Arc::new(api), storage.clone(), StorageKeys::default());

        let (first, second) = (credentials("a"), credentials("b"));
        // B completes first, then A's response is released.
        let (a, b) = tokio::join!(store.sign_in(&first), async {
            let result = store.sign_in(&second).await;
            gate.notify_one();
            result
        });

        assert_eq!(b.unwrap(), user("b"));
        assert_eq!(a.unwrap(), user("a"));
        assert_eq!(store.user(), Some(user("a")));
        assert_eq!(store.token().as_deref(), Some("token-a"));
        let (token, user_json) = persisted(&*storage).await;
        assert_eq!(token.as_deref(), Some("token-a"));
        assert_eq!(user_json, Some(serde_json::to_string(&user("a")).unwrap()));
    }
}
