//! In-memory cache of server-owned collections.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lru::LruCache;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryState};
use super::key::{InvalidationPattern, QueryKey, ResourceType};
use crate::error::ApiError;
use crate::session::{SessionListener, SignOutReason};

type Payload = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<Payload, ApiError>>>;

/// Capacity and freshness settings.
#[derive(Debug, Clone)]
pub struct CachePolicy {
  pub capacity: NonZeroUsize,
  pub default_ttl: Duration,
  pub ttls: HashMap<ResourceType, Duration>,
}

impl CachePolicy {
  pub fn ttl_for(&self, resource: ResourceType) -> Duration {
    self
      .ttls
      .get(&resource)
      .copied()
      .unwrap_or(self.default_ttl)
  }

  pub fn with_ttl(mut self, resource: ResourceType, ttl: Duration) -> Self {
    self.ttls.insert(resource, ttl);
    self
  }
}

impl Default for CachePolicy {
  /// Lists go stale after 30 seconds, aggregates after a minute.
  fn default() -> Self {
    let ttls = HashMap::from([
      (ResourceType::Invoice, Duration::from_secs(30)),
      (ResourceType::Transaction, Duration::from_secs(30)),
      (ResourceType::BankAccount, Duration::from_secs(60)),
      (ResourceType::CategorizationBreakdown, Duration::from_secs(60)),
      (ResourceType::ReconciliationStats, Duration::from_secs(60)),
    ]);
    Self {
      capacity: NonZeroUsize::new(256).unwrap_or(NonZeroUsize::MIN),
      default_ttl: Duration::from_secs(60),
      ttls,
    }
  }
}

struct Slot {
  data: Option<Payload>,
  fetched_at: Option<(Instant, DateTime<Utc>)>,
  ttl: Duration,
  /// Set by `invalidate`; cleared by the next successful fetch.
  invalidated: bool,
  error: Option<ApiError>,
  in_flight: Option<SharedFetch>,
  /// Bumped by `invalidate` so a fetch started earlier lands as stale.
  generation: u64,
}

impl Slot {
  fn empty(ttl: Duration) -> Self {
    Self {
      data: None,
      fetched_at: None,
      ttl,
      invalidated: false,
      error: None,
      in_flight: None,
      generation: 0,
    }
  }

  fn is_fresh(&self, now: Instant) -> bool {
    match self.fetched_at {
      Some((at, _)) => !self.invalidated && now.duration_since(at) < self.ttl,
      None => false,
    }
  }

  fn state(&self, now: Instant) -> EntryState {
    if self.in_flight.is_some() {
      EntryState::Fetching
    } else if let Some(err) = &self.error {
      EntryState::Error(err.clone())
    } else if self.is_fresh(now) {
      EntryState::Fresh
    } else {
      EntryState::Stale
    }
  }
}

struct Inner {
  entries: LruCache<QueryKey, Slot>,
  /// Bumped by `evict_all`; fetches from an older epoch are discarded.
  epoch: u64,
}

/// What a lookup decided, computed under the lock.
enum Lookup<T> {
  Hit(T),
  /// Stale data; serve it and refresh in the background.
  Revalidate(T),
  Join(SharedFetch),
  Miss,
}

/// Keyed, TTL-based store of fetched resource collections.
///
/// The only writer of cache entries. Values are stored type-erased and
/// handed back as clones of the type they were fetched as.
pub struct CacheDirectory {
  inner: Arc<Mutex<Inner>>,
  policy: CachePolicy,
}

impl CacheDirectory {
  pub fn new(policy: CachePolicy) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        entries: LruCache::new(policy.capacity),
        epoch: 0,
      })),
      policy,
    }
  }

  pub fn policy(&self) -> &CachePolicy {
    &self.policy
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Look at an entry without fetching. Does not refresh LRU recency.
  pub fn read<T: Clone + 'static>(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
    let inner = self.lock();
    let slot = inner.entries.peek(key)?;
    Some(CacheEntry {
      key: key.clone(),
      data: slot
        .data
        .as_ref()
        .and_then(|d| d.downcast_ref::<T>())
        .cloned(),
      fetched_at: slot.fetched_at.map(|(_, at)| at),
      ttl: slot.ttl,
      state: slot.state(Instant::now()),
    })
  }

  /// Serve `key` from the cache, fetching with `fetcher` when needed.
  ///
  /// - fresh: cached value, no network
  /// - stale: cached value, plus one background refetch
  /// - absent or errored: awaits a fetch, shared with any concurrent callers
  ///
  /// `fetcher` is called with no cache lock held.
  pub async fn fetch_or_serve<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T, ApiError>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let looked_up = lookup::<T>(&mut self.lock(), key, Instant::now());
    let pending = match looked_up {
      Lookup::Hit(data) => {
        debug!(key = %key, "cache hit");
        return Ok(data);
      }
      Lookup::Revalidate(data) => {
        debug!(key = %key, fingerprint = %key.fingerprint(), "serving stale, revalidating");
        let fetch = fetcher();
        let mut inner = self.lock();
        if in_flight(&inner, key).is_none() {
          let _ = self.start_fetch::<T, _>(&mut inner, key, fetch);
        }
        return Ok(data);
      }
      Lookup::Join(pending) => {
        debug!(key = %key, "joining in-flight fetch");
        pending
      }
      Lookup::Miss => {
        debug!(key = %key, fingerprint = %key.fingerprint(), "cache miss");
        let fetch = fetcher();
        let mut inner = self.lock();
        // Another caller may have started one while the lock was released
        match in_flight(&inner, key) {
          Some(pending) => pending,
          None => self.start_fetch::<T, _>(&mut inner, key, fetch),
        }
      }
    };

    let payload = pending.await?;
    payload
      .downcast_ref::<T>()
      .cloned()
      .ok_or_else(|| ApiError::malformed(0, format!("cached value for {} has another type", key)))
  }

  /// Register a fetch for `key` and drive it on its own task so it finishes
  /// even if every caller goes away.
  fn start_fetch<T, Fut>(&self, inner: &mut Inner, key: &QueryKey, fetch: Fut) -> SharedFetch
  where
    T: Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let ttl = self.policy.ttl_for(key.resource());
    let epoch = inner.epoch;
    let slot = inner
      .entries
      .get_or_insert_mut(key.clone(), || Slot::empty(ttl));
    let generation = slot.generation;

    let state = Arc::clone(&self.inner);
    let task_key = key.clone();
    let task = async move {
      let result = fetch.await.map(|data| Arc::new(data) as Payload);
      complete_fetch(&state, &task_key, epoch, generation, ttl, &result);
      result
    }
    .boxed()
    .shared();

    slot.in_flight = Some(task.clone());
    tokio::spawn(task.clone());
    task
  }

  /// Mark every entry matching `pattern` stale. Returns how many matched.
  pub fn invalidate(&self, pattern: impl Into<InvalidationPattern>) -> usize {
    let pattern = pattern.into();
    let mut inner = self.lock();
    let mut matched = 0;
    for (key, slot) in inner.entries.iter_mut() {
      if pattern.matches(key) {
        slot.generation += 1;
        slot.invalidated = true;
        matched += 1;
      }
    }
    if matched > 0 {
      debug!(?pattern, matched, "invalidated cache entries");
    }
    matched
  }

  /// Mark exactly `key` stale. Returns whether it was cached.
  pub fn invalidate_key(&self, key: &QueryKey) -> bool {
    let mut inner = self.lock();
    match inner.entries.peek_mut(key) {
      Some(slot) => {
        slot.generation += 1;
        slot.invalidated = true;
        true
      }
      None => false,
    }
  }

  /// Drop every entry. Fetches still in flight will not repopulate.
  pub fn evict_all(&self) -> usize {
    let mut inner = self.lock();
    let evicted = inner.entries.len();
    inner.entries.clear();
    inner.epoch += 1;
    debug!(evicted, "evicted all cache entries");
    evicted
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl SessionListener for CacheDirectory {
  fn session_cleared(&self, reason: SignOutReason) {
    let evicted = self.evict_all();
    debug!(?reason, evicted, "cache evicted on sign-out");
  }

  fn session_replaced(&self) {
    let evicted = self.evict_all();
    debug!(evicted, "cache evicted on identity change");
  }
}

fn lookup<T: Clone + 'static>(inner: &mut Inner, key: &QueryKey, now: Instant) -> Lookup<T> {
  let Some(slot) = inner.entries.get(key) else {
    return Lookup::Miss;
  };

  if slot.error.is_none() {
    if let Some(data) = slot.data.as_ref().and_then(|d| d.downcast_ref::<T>()) {
      if slot.is_fresh(now) || slot.in_flight.is_some() {
        return Lookup::Hit(data.clone());
      }
      return Lookup::Revalidate(data.clone());
    }
  }

  match &slot.in_flight {
    Some(pending) => Lookup::Join(pending.clone()),
    None => Lookup::Miss,
  }
}

fn in_flight(inner: &Inner, key: &QueryKey) -> Option<SharedFetch> {
  inner.entries.peek(key).and_then(|slot| slot.in_flight.clone())
}

fn complete_fetch(
  state: &Mutex<Inner>,
  key: &QueryKey,
  epoch: u64,
  generation: u64,
  ttl: Duration,
  result: &Result<Payload, ApiError>,
) {
  let mut inner = state.lock().unwrap_or_else(|e| e.into_inner());
  if inner.epoch != epoch {
    debug!(key = %key, "discarding fetch from before eviction");
    return;
  }

  let now = (Instant::now(), Utc::now());
  match inner.entries.peek_mut(key) {
    Some(slot) => {
      slot.in_flight = None;
      match result {
        Ok(data) => {
          slot.data = Some(Arc::clone(data));
          slot.fetched_at = Some(now);
          slot.error = None;
          // Invalidated while the request was on the wire
          slot.invalidated = slot.generation != generation;
        }
        Err(e) => {
          warn!(key = %key, error = %e, "fetch failed");
          slot.error = Some(e.clone());
        }
      }
    }
    None => {
      // Pushed out by LRU pressure while fetching
      if let Ok(data) = result {
        let mut slot = Slot::empty(ttl);
        slot.data = Some(Arc::clone(data));
        slot.fetched_at = Some(now);
        inner.entries.put(key.clone(), slot);
      }
    }
  }
}

impl std::fmt::Debug for CacheDirectory {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheDirectory")
      .field("len", &self.len())
      .field("policy", &self.policy)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn directory() -> Arc<CacheDirectory> {
    Arc::new(CacheDirectory::new(CachePolicy::default()))
  }

  fn invoices() -> QueryKey {
    QueryKey::new(ResourceType::Invoice).param("page", 1)
  }

  /// Fetcher that counts calls and returns the call number after `delay`.
  fn counting(
    counter: &Arc<AtomicU32>,
    delay: Duration,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<u32, ApiError>> {
    let counter = counter.clone();
    move || {
      async move {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(delay).await;
        Ok(n)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_miss_then_hit() {
    let cache = directory();
    let counter = Arc::new(AtomicU32::new(0));

    let first = cache
      .fetch_or_serve(&invoices(), counting(&counter, Duration::ZERO))
      .await
      .unwrap();
    let second = cache
      .fetch_or_serve(&invoices(), counting(&counter, Duration::ZERO))
      .await
      .unwrap();

    assert_eq!(first, 1);
    assert_eq!(second, 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(cache.read::<u32>(&invoices()).unwrap().is_fresh());
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_reads_coalesce() {
    let cache = directory();
    let counter = Arc::new(AtomicU32::new(0));

    let key = invoices();

    let (a, b, c) = tokio::join!(
      cache.fetch_or_serve(&key, counting(&counter, Duration::from_millis(50))),
      cache.fetch_or_serve(&key, counting(&counter, Duration::from_millis(50))),
      cache.fetch_or_serve(&key, counting(&counter, Duration::from_millis(50))),
    );

    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 1, 1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_ttl_expiry_gives_stale_not_absent() {
    let cache = directory();
    let counter = Arc::new(AtomicU32::new(0));
    cache
      .fetch_or_serve(&invoices(), counting(&counter, Duration::ZERO))
      .await
      .unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;

    let entry = cache.read::<u32>(&invoices()).unwrap();
    assert!(entry.is_stale());
    assert_eq!(entry.data, Some(1));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stale_served_immediately_and_refreshed_in_place() {
    let cache = directory();
    let counter = Arc::new(AtomicU32::new(0));
    cache
      .fetch_or_serve(&invoices(), counting(&counter, Duration::ZERO))
      .await
      .unwrap();
    cache.invalidate(ResourceType::Invoice);

    let served_at = Instant::now();
    let value = cache
      .fetch_or_serve(&invoices(), counting(&counter, Duration::from_secs(5)))
      .await
      .unwrap();

    // Old value, no waiting on the 5s refetch
    assert_eq!(value, 1);
    assert_eq!(Instant::now(), served_at);
    assert_eq!(cache.read::<u32>(&invoices()).unwrap().state, EntryState::Fetching);

    tokio::time::sleep(Duration::from_secs(6)).await;

    let entry = cache.read::<u32>(&invoices()).unwrap();
    assert_eq!(entry.data, Some(2));
    assert!(entry.is_fresh());
  }

  #[tokio::test]
  async fn test_invalidate_by_resource_only() {
    let cache = directory();
    let txs = QueryKey::new(ResourceType::Transaction);
    cache
      .fetch_or_serve(&invoices(), || async { Ok::<_, ApiError>(1u32) })
      .await
      .unwrap();
    cache
      .fetch_or_serve(&txs, || async { Ok::<_, ApiError>(2u32) })
      .await
      .unwrap();

    assert_eq!(cache.invalidate(ResourceType::Invoice), 1);
    assert!(cache.read::<u32>(&invoices()).unwrap().is_stale());
    assert!(cache.read::<u32>(&txs).unwrap().is_fresh());
  }

  #[tokio::test]
  async fn test_invalidate_without_matches_is_noop() {
    let cache = directory();
    cache
      .fetch_or_serve(&invoices(), || async { Ok::<_, ApiError>(1u32) })
      .await
      .unwrap();

    assert_eq!(cache.invalidate(ResourceType::BankAccount), 0);
    assert_eq!(cache.invalidate(ResourceType::BankAccount), 0);
    assert!(cache.read::<u32>(&invoices()).unwrap().is_fresh());
  }

  #[tokio::test]
  async fn test_invalidate_key_is_exact() {
    let cache = directory();
    let page2 = QueryKey::new(ResourceType::Invoice).param("page", 2);
    for key in [invoices(), page2.clone()] {
      cache
        .fetch_or_serve(&key, || async { Ok::<_, ApiError>(1u32) })
        .await
        .unwrap();
    }

    assert!(cache.invalidate_key(&invoices()));
    assert!(cache.read::<u32>(&invoices()).unwrap().is_stale());
    assert!(cache.read::<u32>(&page2).unwrap().is_fresh());
    assert!(!cache.invalidate_key(&QueryKey::new(ResourceType::BankAccount)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidated_mid_flight_lands_stale() {
    let cache = directory();
    let counter = Arc::new(AtomicU32::new(0));

    let key = invoices();

    let fetch = cache.fetch_or_serve(&key, counting(&counter, Duration::from_secs(1)));
    let invalidate = async {
      tokio::time::sleep(Duration::from_millis(500)).await;
      cache.invalidate(ResourceType::Invoice)
    };
    let (value, matched) = tokio::join!(fetch, invalidate);

    assert_eq!(value.unwrap(), 1);
    assert_eq!(matched, 1);
    assert!(cache.read::<u32>(&invoices()).unwrap().is_stale());
  }

  #[tokio::test]
  async fn test_failed_fetch_surfaces_and_marks_error() {
    let cache = directory();
    let err = cache
      .fetch_or_serve(&invoices(), || async {
        Err::<u32, _>(ApiError::ServerFault {
          status: 500,
          detail: "boom".to_string(),
        })
      })
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::ServerFault { status: 500, .. }));

    let entry = cache.read::<u32>(&invoices()).unwrap();
    assert!(matches!(entry.state, EntryState::Error(_)));

    // Next read awaits a fresh fetch instead of serving the error
    let value = cache
      .fetch_or_serve(&invoices(), || async { Ok::<_, ApiError>(7u32) })
      .await
      .unwrap();
    assert_eq!(value, 7);
  }

  #[tokio::test(start_paused = true)]
  async fn test_eviction_discards_in_flight_fetch() {
    let cache = directory();
    let counter = Arc::new(AtomicU32::new(0));

    let key = invoices();

    let fetch = cache.fetch_or_serve(&key, counting(&counter, Duration::from_secs(1)));
    let evict = async {
      tokio::time::sleep(Duration::from_millis(10)).await;
      cache.evict_all()
    };
    let (value, _) = tokio::join!(fetch, evict);

    // The caller still gets its answer, but the cache stays empty
    assert_eq!(value.unwrap(), 1);
    assert!(cache.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_caller_still_populates() {
    let cache = directory();
    let counter = Arc::new(AtomicU32::new(0));

    let key = invoices();

    let fetch = cache.fetch_or_serve(&key, counting(&counter, Duration::from_secs(1)));
    let _ = tokio::time::timeout(Duration::from_millis(10), fetch).await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(cache.read::<u32>(&invoices()).unwrap().data, Some(1));
  }

  #[tokio::test]
  async fn test_capacity_is_bounded() {
    let policy = CachePolicy {
      capacity: NonZeroUsize::new(2).unwrap(),
      ..CachePolicy::default()
    };
    let cache = CacheDirectory::new(policy);

    for page in 1..=3u32 {
      let key = QueryKey::new(ResourceType::Invoice).param("page", page);
      cache
        .fetch_or_serve(&key, move || async move { Ok::<_, ApiError>(page) })
        .await
        .unwrap();
    }

    assert_eq!(cache.len(), 2);
    assert!(cache
      .read::<u32>(&QueryKey::new(ResourceType::Invoice).param("page", 1))
      .is_none());
  }

  #[tokio::test]
  async fn test_fetcher_may_touch_the_cache() {
    let cache = directory();
    let seen = cache
      .fetch_or_serve(&invoices(), || {
        let len = cache.len() as u32;
        async move { Ok::<_, ApiError>(len) }
      })
      .await
      .unwrap();
    assert_eq!(seen, 0);

    cache.invalidate(ResourceType::Invoice);
    let stale = cache
      .fetch_or_serve(&invoices(), || {
        let stale = cache.read::<u32>(&invoices()).map(|e| e.is_stale());
        async move { Ok::<_, ApiError>(u32::from(stale == Some(true))) }
      })
      .await
      .unwrap();
    assert_eq!(stale, 0);

    // The background refresh saw its own entry as stale
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.read::<u32>(&invoices()).unwrap().data, Some(1));
  }

  #[tokio::test]
  async fn test_session_clear_evicts() {
    let cache = directory();
    cache
      .fetch_or_serve(&invoices(), || async { Ok::<_, ApiError>(1u32) })
      .await
      .unwrap();

    cache.session_cleared(SignOutReason::Logout);
    assert!(cache.is_empty());
  }
}
