//! Authentication session: the current bearer token and its lifecycle.
//!
//! - Absent at cold start (unless a persisted session is restored)
//! - Populated by a successful login exchange
//! - Cleared on logout, expiry, or a 401 from the server

mod storage;
mod store;

pub use storage::{NoopTokenStorage, SqliteTokenStorage, TokenStorage};
pub use store::{LoginTicket, SessionEvent, SessionListener, SessionStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque bearer token. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Debug for AccessToken {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("AccessToken(..)")
  }
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
  pub token: AccessToken,
  pub issued_at: DateTime<Utc>,
  pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
  pub fn new(token: AccessToken) -> Self {
    Self {
      token,
      issued_at: Utc::now(),
      expires_at: None,
    }
  }

  pub fn with_lifetime(mut self, lifetime: chrono::Duration) -> Self {
    self.expires_at = Some(self.issued_at + lifetime);
    self
  }

  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|exp| now >= exp)
  }
}

/// Either there is a session or there explicitly is not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
  #[default]
  Absent,
  Active(Session),
}

impl SessionState {
  pub fn is_active(&self) -> bool {
    matches!(self, SessionState::Active(_))
  }

  pub fn token(&self) -> Option<&AccessToken> {
    match self {
      SessionState::Active(session) => Some(&session.token),
      SessionState::Absent => None,
    }
  }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
  /// The user asked to sign out.
  Logout,
  /// The server rejected the token.
  Unauthenticated,
  /// The token passed its known expiry time.
  Expired,
}
