//! Wiring of the sync components into one owned context.

use color_eyre::Result;
use std::sync::Arc;

use crate::api::DashboardClient;
use crate::bulk::BulkJobTracker;
use crate::cache::CacheDirectory;
use crate::config::Config;
use crate::mutation::MutationCoordinator;
use crate::session::{NoopTokenStorage, SessionStore, SqliteTokenStorage, TokenStorage};
use crate::transport::{HttpBackend, ReqwestBackend, Transport};

/// Every shared component, built once and handed to the front-end.
///
/// The cache is registered with the session store, so any sign-out evicts it
/// before the sign-out call returns.
pub struct SyncContext {
  pub session: Arc<SessionStore>,
  pub cache: Arc<CacheDirectory>,
  pub transport: Arc<Transport>,
  pub mutations: Arc<MutationCoordinator>,
  pub bulk: Arc<BulkJobTracker>,
  pub client: DashboardClient,
}

impl SyncContext {
  pub fn new(
    config: &Config,
    backend: Arc<dyn HttpBackend>,
    storage: Box<dyn TokenStorage>,
  ) -> Result<Self> {
    let session = Arc::new(SessionStore::new(storage));
    let cache = Arc::new(CacheDirectory::new(config.cache_policy()?));
    session.add_listener(cache.clone());

    let transport = Arc::new(
      Transport::new(backend, config.api_url()?, Arc::clone(&session)).with_timeout(config.timeout()),
    );
    let mutations = Arc::new(MutationCoordinator::new(
      Arc::clone(&transport),
      Arc::clone(&cache),
    ));
    let bulk = Arc::new(BulkJobTracker::new(Arc::clone(&transport), Arc::clone(&cache)));

    let mut client = DashboardClient::new(
      Arc::clone(&transport),
      Arc::clone(&session),
      Arc::clone(&cache),
      Arc::clone(&mutations),
      Arc::clone(&bulk),
    );
    if let Some(lifetime) = config.token_lifetime() {
      client = client.with_token_lifetime(lifetime);
    }

    Ok(Self {
      session,
      cache,
      transport,
      mutations,
      bulk,
      client,
    })
  }

  /// Context talking to the configured server over HTTP, with the session
  /// persisted when `session.persist` is set.
  pub fn connect(config: &Config) -> Result<Self> {
    let backend = ReqwestBackend::new(config.timeout())?;
    let storage: Box<dyn TokenStorage> = if config.session.persist {
      Box::new(SqliteTokenStorage::open()?)
    } else {
      Box::new(NoopTokenStorage)
    };
    Self::new(config, Arc::new(backend), storage)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::invoice_json;
  use crate::api::types::InvoiceFilter;
  use crate::session::{AccessToken, Session, SessionState};
  use crate::testing::{json_response, FakeBackend};
  use serde_json::json;

  fn context(backend: Arc<FakeBackend>) -> SyncContext {
    SyncContext::new(&Config::default(), backend, Box::new(NoopTokenStorage)).unwrap()
  }

  #[tokio::test]
  async fn test_logout_evicts_cache() {
    let backend = FakeBackend::new(|_| {
      Ok(json_response(
        200,
        json!({"invoices": [invoice_json("i1", "INV-1")], "total": 1, "page": 1, "page_size": 50, "total_pages": 1}),
      ))
    });
    let ctx = context(backend);
    ctx.session.set(Session::new(AccessToken::new("tok")));

    ctx
      .client
      .invoices(1, 50, &InvoiceFilter::default())
      .await
      .unwrap();
    assert_eq!(ctx.cache.len(), 1);

    ctx.client.logout();

    assert!(ctx.cache.is_empty());
    assert_eq!(ctx.session.get(), SessionState::Absent);
  }

  #[tokio::test]
  async fn test_requests_go_to_configured_base() {
    let backend = FakeBackend::new(|_| Ok(json_response(200, json!({"accounts": [], "total": 0}))));
    let mut config = Config::default();
    config.api.base_url = "https://books.example.com/api/v1".to_string();
    let ctx = SyncContext::new(&config, backend.clone(), Box::new(NoopTokenStorage)).unwrap();
    ctx.session.set(Session::new(AccessToken::new("tok")));

    ctx.client.bank_accounts().await.unwrap();

    assert_eq!(
      backend.calls()[0].url.as_str(),
      "https://books.example.com/api/v1/banks/"
    );
  }

  #[test]
  fn test_invalid_base_url_is_rejected() {
    let mut config = Config::default();
    config.api.base_url = "not a url".to_string();
    let backend = FakeBackend::new(|_| unreachable!());
    assert!(SyncContext::new(&config, backend, Box::new(NoopTokenStorage)).is_err());
  }
}
