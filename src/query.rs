//! View-side handle over a cached read.
//!
//! A `Query<T>` belongs to one view and reads through the [`CacheDirectory`],
//! so views of the same key share one entry and one in-flight fetch. The
//! view drives it from its own tick: call [`Query::fetch`] once, then
//! [`Query::poll`] each tick and redraw whenever it returns `true`.
//!
//! ```ignore
//! let mut overdue = client.invoices_query(1, 20, filter);
//! overdue.fetch();
//! loop {
//!   if overdue.poll() {
//!     redraw(overdue.state());
//!   }
//!   tick.await;
//! }
//! ```

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::{CacheDirectory, QueryKey};
use crate::error::ApiError;

/// What a view currently has to show.
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// `fetch` not called yet
  Idle,
  /// Waiting for the first value
  Loading,
  Success(T),
  Error(ApiError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ApiError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

type FetcherFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

/// A value plus the fetch time of the cache entry it came from.
type Delivery<T> = Result<(T, Option<DateTime<Utc>>), ApiError>;

/// Cached read owned by a view.
///
/// Dropping the handle (or calling `refetch`) cancels only this view's wait.
/// The fetch itself keeps running and still populates the cache.
pub struct Query<T> {
  state: QueryState<T>,
  cache: Arc<CacheDirectory>,
  key: QueryKey,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Delivery<T>>>,
  task: Option<JoinHandle<()>>,
  /// Fetch time of the entry currently shown.
  fetched_at: Option<DateTime<Utc>>,
}

impl<T: Clone + Send + Sync + 'static> Query<T> {
  /// Create a query for `key`. `fetcher` performs the network read when the
  /// cache needs one.
  pub fn new<F, Fut>(cache: Arc<CacheDirectory>, key: QueryKey, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      cache,
      key,
      fetcher: Arc::new(move || fetcher().boxed()),
      receiver: None,
      task: None,
      fetched_at: None,
    }
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.state.error()
  }

  /// True while this view waits on the cache.
  pub fn is_pending(&self) -> bool {
    self.receiver.is_some()
  }

  /// Whether the shown data is no longer fresh in the cache.
  pub fn is_stale(&self) -> bool {
    match &self.state {
      QueryState::Success(_) => self
        .cache
        .read::<T>(&self.key)
        .map(|entry| !entry.is_fresh())
        .unwrap_or(true),
      _ => false,
    }
  }

  /// Start reading if not already waiting.
  pub fn fetch(&mut self) {
    if self.is_pending() {
      return;
    }
    self.start_fetch();
  }

  /// Mark the entry stale and read again. The current wait, if any, is dropped.
  pub fn refetch(&mut self) {
    self.cancel();
    self.cache.invalidate_key(&self.key);
    self.start_fetch();
  }

  /// Non-blocking check for new data.
  ///
  /// Returns `true` if the state changed: a pending read finished, or the
  /// cache entry was refreshed in place since the last poll.
  pub fn poll(&mut self) -> bool {
    let Some(receiver) = &mut self.receiver else {
      return self.pick_up_refresh();
    };

    match receiver.try_recv() {
      Ok(Ok((data, fetched_at))) => {
        self.state = QueryState::Success(data);
        self.fetched_at = fetched_at;
        self.finish();
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.finish();
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = QueryState::Error(ApiError::NetworkUnreachable {
          reason: "query was cancelled".to_string(),
        });
        self.finish();
        true
      }
    }
  }

  fn pick_up_refresh(&mut self) -> bool {
    if !self.state.is_success() {
      return false;
    }
    let Some(entry) = self.cache.read::<T>(&self.key) else {
      return false;
    };
    match entry.data {
      Some(data) if entry.fetched_at != self.fetched_at => {
        self.state = QueryState::Success(data);
        self.fetched_at = entry.fetched_at;
        true
      }
      _ => false,
    }
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if !self.state.is_success() {
      self.state = QueryState::Loading;
    }

    let cache = Arc::clone(&self.cache);
    let fetcher = Arc::clone(&self.fetcher);
    let key = self.key.clone();
    self.task = Some(tokio::spawn(async move {
      let result = cache
        .fetch_or_serve(&key, || fetcher())
        .await
        .map(|data| latest(&cache, &key, data));
      // Receiver may be gone
      let _ = tx.send(result);
    }));
  }

  fn cancel(&mut self) {
    self.receiver = None;
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }

  fn finish(&mut self) {
    self.receiver = None;
    self.task = None;
  }
}

/// Prefer the entry's current value: a background refresh may already have
/// replaced what `fetch_or_serve` handed back.
fn latest<T: Clone + 'static>(
  cache: &CacheDirectory,
  key: &QueryKey,
  served: T,
) -> (T, Option<DateTime<Utc>>) {
  match cache.read::<T>(key) {
    Some(entry) => match entry.data {
      Some(data) => (data, entry.fetched_at),
      None => (served, None),
    },
    None => (served, None),
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("fetched_at", &self.fetched_at)
      .finish_non_exhaustive()
  }
}
