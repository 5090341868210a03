//! The session store: single writer of the session state.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::storage::TokenStorage;
use super::{AccessToken, Session, SessionState, SignOutReason};

/// Notifications published to subscribers (views) when the session changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
  /// No transition has happened yet.
  Initial,
  SignedIn,
  /// The session ended. Views should return to the unauthenticated entry point.
  SignedOut(SignOutReason),
}

/// Components that must react synchronously to session changes.
pub trait SessionListener: Send + Sync {
  /// Runs after the state is cleared and before `clear` returns.
  fn session_cleared(&self, reason: SignOutReason);

  /// Runs when an active session is replaced by one with another token,
  /// before the new token becomes visible.
  fn session_replaced(&self) {}
}

/// Proof that a login exchange started at a particular point in time.
///
/// If the session is cleared while the exchange is underway the ticket
/// goes stale and the login result is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginTicket {
  epoch: u64,
}

pub struct SessionStore {
  state: RwLock<SessionState>,
  /// Serializes `set`/`clear` including their persistence side effects.
  write_lock: Mutex<()>,
  /// Bumped on every clear.
  clear_epoch: AtomicU64,
  storage: Box<dyn TokenStorage>,
  listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
  events: watch::Sender<SessionEvent>,
}

impl SessionStore {
  /// Create a store, restoring a persisted session if the storage has one.
  pub fn new(storage: Box<dyn TokenStorage>) -> Self {
    let restored = match storage.load() {
      Ok(Some(session)) if !session.is_expired(Utc::now()) => {
        debug!("restored persisted session");
        SessionState::Active(session)
      }
      Ok(Some(_)) => {
        debug!("discarding expired persisted session");
        if let Err(e) = storage.clear() {
          warn!(error = %e, "failed to clear expired session");
        }
        SessionState::Absent
      }
      Ok(None) => SessionState::Absent,
      Err(e) => {
        warn!(error = %e, "failed to load persisted session");
        SessionState::Absent
      }
    };

    let (events, _) = watch::channel(SessionEvent::Initial);

    Self {
      state: RwLock::new(restored),
      write_lock: Mutex::new(()),
      clear_epoch: AtomicU64::new(0),
      storage,
      listeners: RwLock::new(Vec::new()),
      events,
    }
  }

  /// Register a component to be told synchronously about session loss.
  pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
    self
      .listeners
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .push(listener);
  }

  /// Snapshot of the current state.
  pub fn get(&self) -> SessionState {
    self
      .state
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Current token, if any. An expired session is cleared here and reported absent.
  pub fn token(&self) -> Option<AccessToken> {
    let session = match self.get() {
      SessionState::Active(session) => session,
      SessionState::Absent => return None,
    };

    if session.is_expired(Utc::now()) {
      self.clear_if_current(&session.token, SignOutReason::Expired);
      return None;
    }

    Some(session.token)
  }

  pub fn is_authenticated(&self) -> bool {
    self.token().is_some()
  }

  /// Subscribe to session transitions.
  pub fn subscribe(&self) -> watch::Receiver<SessionEvent> {
    self.events.subscribe()
  }

  /// Take a ticket before starting a login exchange.
  pub fn begin_login(&self) -> LoginTicket {
    LoginTicket {
      epoch: self.clear_epoch.load(Ordering::SeqCst),
    }
  }

  /// Install the session produced by a login exchange.
  ///
  /// Returns `false` (and installs nothing) if the session was cleared after
  /// the ticket was taken.
  pub fn commit_login(&self, ticket: LoginTicket, session: Session) -> bool {
    {
      let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
      if self.clear_epoch.load(Ordering::SeqCst) != ticket.epoch {
        info!("login completed after sign-out, discarding session");
        return false;
      }
      self.install(session);
    }

    self.events.send_replace(SessionEvent::SignedIn);
    true
  }

  /// Install a session unconditionally.
  pub fn set(&self, session: Session) {
    {
      let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
      self.install(session);
    }
    self.events.send_replace(SessionEvent::SignedIn);
  }

  /// End the session. Listeners (the cache) run before this returns.
  pub fn clear(&self, reason: SignOutReason) {
    {
      let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
      self.reset(reason);
    }
    self.notify_cleared(reason);
  }

  /// End the session only if `token` is still the current one.
  ///
  /// A 401 for a token that has since been replaced by a fresh login must
  /// not sign the new session out.
  pub fn clear_if_current(&self, token: &AccessToken, reason: SignOutReason) -> bool {
    {
      let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
      let current = self.state.read().unwrap_or_else(|e| e.into_inner());
      if current.token() != Some(token) {
        return false;
      }
      drop(current);
      self.reset(reason);
    }
    self.notify_cleared(reason);
    true
  }

  /// Caller holds `write_lock`.
  fn install(&self, session: Session) {
    let replaced = matches!(
      &*self.state.read().unwrap_or_else(|e| e.into_inner()),
      SessionState::Active(current) if current.token != session.token
    );
    if replaced {
      info!("replacing active session");
      for listener in self.listeners() {
        listener.session_replaced();
      }
    }

    if let Err(e) = self.storage.save(&session) {
      warn!(error = %e, "failed to persist session");
    }
    *self.state.write().unwrap_or_else(|e| e.into_inner()) = SessionState::Active(session);
    info!("session established");
  }

  /// Caller holds `write_lock`.
  fn reset(&self, reason: SignOutReason) {
    self.clear_epoch.fetch_add(1, Ordering::SeqCst);
    *self.state.write().unwrap_or_else(|e| e.into_inner()) = SessionState::Absent;
    if let Err(e) = self.storage.clear() {
      warn!(error = %e, "failed to clear persisted session");
    }
    info!(?reason, "session cleared");
  }

  fn listeners(&self) -> Vec<Arc<dyn SessionListener>> {
    self
      .listeners
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  fn notify_cleared(&self, reason: SignOutReason) {
    for listener in self.listeners() {
      listener.session_cleared(reason);
    }
    self.events.send_replace(SessionEvent::SignedOut(reason));
  }
}

impl std::fmt::Debug for SessionStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionStore")
      .field("active", &self.get().is_active())
      .field("clear_epoch", &self.clear_epoch.load(Ordering::SeqCst))
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::NoopTokenStorage;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct CountingListener {
    cleared: AtomicUsize,
    replaced: AtomicUsize,
  }

  impl SessionListener for CountingListener {
    fn session_cleared(&self, _reason: SignOutReason) {
      self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn session_replaced(&self) {
      self.replaced.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn store() -> SessionStore {
    SessionStore::new(Box::new(NoopTokenStorage))
  }

  fn session(token: &str) -> Session {
    Session::new(AccessToken::new(token))
  }

  #[test]
  fn test_cold_start_is_absent() {
    let store = store();
    assert_eq!(store.get(), SessionState::Absent);
    assert!(store.token().is_none());
  }

  #[test]
  fn test_set_then_clear() {
    let store = store();
    store.set(session("abc"));
    assert_eq!(store.token(), Some(AccessToken::new("abc")));

    store.clear(SignOutReason::Logout);
    assert_eq!(store.get(), SessionState::Absent);
  }

  #[test]
  fn test_clear_wins_over_login_in_progress() {
    let store = store();
    let ticket = store.begin_login();

    // Logout lands while the login request is still on the wire
    store.clear(SignOutReason::Logout);

    assert!(!store.commit_login(ticket, session("late")));
    assert!(store.token().is_none());
  }

  #[test]
  fn test_commit_login_with_valid_ticket() {
    let store = store();
    let ticket = store.begin_login();
    assert!(store.commit_login(ticket, session("fresh")));
    assert!(store.is_authenticated());
  }

  #[test]
  fn test_clear_if_current_ignores_replaced_token() {
    let store = store();
    store.set(session("old"));
    store.set(session("new"));

    assert!(!store.clear_if_current(&AccessToken::new("old"), SignOutReason::Unauthenticated));
    assert_eq!(store.token(), Some(AccessToken::new("new")));

    assert!(store.clear_if_current(&AccessToken::new("new"), SignOutReason::Unauthenticated));
    assert!(store.token().is_none());
  }

  #[test]
  fn test_listeners_run_on_clear() {
    let store = store();
    let listener = Arc::new(CountingListener::default());
    store.add_listener(listener.clone());

    store.set(session("abc"));
    store.clear(SignOutReason::Logout);

    assert_eq!(listener.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(listener.replaced.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_listeners_run_when_another_token_replaces_the_session() {
    let store = store();
    let listener = Arc::new(CountingListener::default());
    store.add_listener(listener.clone());

    store.set(session("user-a"));
    store.set(session("user-a"));
    assert_eq!(listener.replaced.load(Ordering::SeqCst), 0);

    let ticket = store.begin_login();
    assert!(store.commit_login(ticket, session("user-b")));
    assert_eq!(listener.replaced.load(Ordering::SeqCst), 1);
    assert_eq!(listener.cleared.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_expired_session_reads_as_absent() {
    let store = store();
    store.set(session("abc").with_lifetime(chrono::Duration::seconds(-1)));

    assert!(store.token().is_none());
    assert_eq!(store.get(), SessionState::Absent);
    assert_eq!(
      *store.subscribe().borrow(),
      SessionEvent::SignedOut(SignOutReason::Expired)
    );
  }

  #[tokio::test]
  async fn test_subscribers_see_sign_out() {
    let store = store();
    let mut rx = store.subscribe();

    store.set(session("abc"));
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), SessionEvent::SignedIn);

    store.clear(SignOutReason::Unauthenticated);
    rx.changed().await.unwrap();
    assert_eq!(
      *rx.borrow_and_update(),
      SessionEvent::SignedOut(SignOutReason::Unauthenticated)
    );
  }
}
