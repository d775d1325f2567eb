use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Profile of the signed-in user, as returned by the sessions endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub avatar: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// An authenticated identity: a bearer token together with its user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    token: String,
    user: User,
}

impl Session {
    pub fn new(token: impl Into<String>, user: User) -> Self {
        Self {
            token: token.into(),
            user,
        }
    }

    /// Decode a `{token, user}` sessions response. Extra fields are ignored;
    /// a missing, mistyped or empty token is rejected.
    pub fn from_response(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let session: Session = serde_json::from_value(value)?;
        if session.token.is_empty() {
            return Err(serde::de::Error::custom("session token is empty"));
        }
        Ok(session)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn user(&self) -> &User {
        &self.user
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInCredentials {
    pub email: String,
    pub password: String,
}

impl SignInCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for SignInCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Snapshot of the session store published to subscribers.
///
/// `loading` is true only until the startup restore settles. While it is
/// true the absence of a session means nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub session: Option<Session>,
    pub loading: bool,
}

impl SessionState {
    /// State of a store that has not restored yet
    pub fn initial() -> Self {
        Self {
            session: None,
            loading: true,
        }
    }

    pub fn user(&self) -> Option<&User> {
        self.session.as_ref().map(Session::user)
    }

    pub fn token(&self) -> Option<&str> {
        self.session.as_ref().map(Session::token)
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.is_some()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::initial()
    }
}
