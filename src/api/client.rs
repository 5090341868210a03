use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::info;

use super::types::{
  BankAccount, BankAccountList, CategoryBreakdown, Credentials, Invoice, InvoiceFilter,
  InvoiceList, InvoiceUpdate, NewBankAccount, NewInvoice, NewReconciliation, Reconciliation,
  ReconciliationStats, ReconciliationSuggestion, Registration, SyncResult, TokenResponse,
  Transaction, TransactionFilter, TransactionList, User,
};
use crate::bulk::{BulkJob, BulkJobTracker, BulkOperation};
use crate::cache::{CacheDirectory, QueryKey, ResourceType};
use crate::error::ApiError;
use crate::mutation::{Mutation, MutationCoordinator};
use crate::query::Query;
use crate::session::{AccessToken, Session, SessionStore, SignOutReason};
use crate::transport::{Request, Transport};

/// Server default and maximum for paged lists. Out-of-range pages are clamped.
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Typed access to the dashboard API.
///
/// Reads are served through the cache, writes go through the mutation
/// coordinator and invalidate whatever the write makes out of date.
#[derive(Clone)]
pub struct DashboardClient {
  transport: Arc<Transport>,
  session: Arc<SessionStore>,
  cache: Arc<CacheDirectory>,
  mutations: Arc<MutationCoordinator>,
  bulk: Arc<BulkJobTracker>,
  token_lifetime: Option<chrono::Duration>,
}

impl DashboardClient {
  pub fn new(
    transport: Arc<Transport>,
    session: Arc<SessionStore>,
    cache: Arc<CacheDirectory>,
    mutations: Arc<MutationCoordinator>,
    bulk: Arc<BulkJobTracker>,
  ) -> Self {
    Self {
      transport,
      session,
      cache,
      mutations,
      bulk,
      token_lifetime: None,
    }
  }

  /// Treat issued tokens as expiring after `lifetime`.
  pub fn with_token_lifetime(mut self, lifetime: chrono::Duration) -> Self {
    self.token_lifetime = Some(lifetime);
    self
  }

  pub fn session(&self) -> &Arc<SessionStore> {
    &self.session
  }

  pub fn cache(&self) -> &Arc<CacheDirectory> {
    &self.cache
  }

  pub fn bulk(&self) -> &Arc<BulkJobTracker> {
    &self.bulk
  }

  // ==========================================================================
  // Auth
  // ==========================================================================

  /// Exchange credentials for a session.
  ///
  /// Fails with `Unauthenticated` if the credentials are rejected, or if a
  /// sign-out happened while the exchange was in flight.
  pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
    let ticket = self.session.begin_login();
    let credentials = Credentials {
      email: email.to_string(),
      password: password.to_string(),
    };
    let response = self
      .transport
      .send(Request::post("auth/login").json(to_body(&credentials)?).anonymous())
      .await?;
    let token: TokenResponse = response.json()?;

    let mut session = Session::new(AccessToken::new(token.access_token));
    if let Some(lifetime) = self.token_lifetime {
      session = session.with_lifetime(lifetime);
    }

    if !self.session.commit_login(ticket, session) {
      return Err(ApiError::Unauthenticated);
    }
    info!("signed in");
    Ok(())
  }

  pub async fn register(&self, registration: &Registration) -> Result<User, ApiError> {
    self
      .transport
      .send(Request::post("auth/register").json(to_body(registration)?).anonymous())
      .await?
      .json()
  }

  /// Sign out. Evicts the cache before returning.
  pub fn logout(&self) {
    self.session.clear(SignOutReason::Logout);
  }

  /// The signed-in user. Not cached.
  pub async fn me(&self) -> Result<User, ApiError> {
    self.transport.send(Request::get("auth/me")).await?.json()
  }

  // ==========================================================================
  // Invoices
  // ==========================================================================

  pub fn invoices_key(page: u32, page_size: u32, filter: &InvoiceFilter) -> QueryKey {
    QueryKey::new(ResourceType::Invoice)
      .param("page", page.max(1))
      .param("page_size", page_size.clamp(1, MAX_PAGE_SIZE))
      .param_opt("status", filter.status)
      .param_opt("is_reconciled", filter.is_reconciled)
      .param_opt("client_name", filter.client_name.as_deref())
  }

  pub async fn invoices(
    &self,
    page: u32,
    page_size: u32,
    filter: &InvoiceFilter,
  ) -> Result<InvoiceList, ApiError> {
    let key = Self::invoices_key(page, page_size, filter);
    self.read(&key, list_request("invoices/", &key)).await
  }

  /// View handle over one page of invoices.
  pub fn invoices_query(&self, page: u32, page_size: u32, filter: InvoiceFilter) -> Query<InvoiceList> {
    self.query(Self::invoices_key(page, page_size, &filter), "invoices/")
  }

  pub async fn invoice(&self, id: &str) -> Result<Invoice, ApiError> {
    let key = QueryKey::new(ResourceType::Invoice).param("id", id);
    self.read(&key, Request::get(format!("invoices/{}", id))).await
  }

  pub async fn create_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, ApiError> {
    let request = Request::post("invoices/").json(to_body(invoice)?);
    let mutation = Mutation::create(ResourceType::Invoice, request)
      .invalidating([ResourceType::ReconciliationStats]);
    self.mutations.mutate(mutation).await?.json()
  }

  pub async fn update_invoice(&self, id: &str, update: &InvoiceUpdate) -> Result<Invoice, ApiError> {
    let request = Request::patch(format!("invoices/{}", id)).json(to_body(update)?);
    let mutation = Mutation::update(ResourceType::Invoice, id, request)
      .invalidating([ResourceType::ReconciliationStats]);
    self.mutations.mutate(mutation).await?.json()
  }

  pub async fn delete_invoice(&self, id: &str) -> Result<(), ApiError> {
    let request = Request::delete(format!("invoices/{}", id));
    let mutation = Mutation::delete(ResourceType::Invoice, id, request)
      .invalidating([ResourceType::ReconciliationStats]);
    self.mutations.mutate(mutation).await?;
    Ok(())
  }

  /// Rendered PDF of an invoice. Not cached.
  pub async fn invoice_pdf(&self, id: &str) -> Result<Vec<u8>, ApiError> {
    let response = self
      .transport
      .send(Request::get(format!("invoices/{}/pdf", id)))
      .await?;
    Ok(response.body)
  }

  // ==========================================================================
  // Transactions and categorization
  // ==========================================================================

  pub fn transactions_key(page: u32, page_size: u32, filter: &TransactionFilter) -> QueryKey {
    QueryKey::new(ResourceType::Transaction)
      .param("page", page.max(1))
      .param("page_size", page_size.clamp(1, MAX_PAGE_SIZE))
      .param_opt("bank_account_id", filter.bank_account_id.as_deref())
      .param_opt("category", filter.category.as_deref())
      .param_opt("is_reconciled", filter.is_reconciled)
      .param_opt("search", filter.search.as_deref())
  }

  pub async fn transactions(
    &self,
    page: u32,
    page_size: u32,
    filter: &TransactionFilter,
  ) -> Result<TransactionList, ApiError> {
    let key = Self::transactions_key(page, page_size, filter);
    self.read(&key, list_request("transactions/", &key)).await
  }

  pub fn transactions_query(
    &self,
    page: u32,
    page_size: u32,
    filter: TransactionFilter,
  ) -> Query<TransactionList> {
    self.query(Self::transactions_key(page, page_size, &filter), "transactions/")
  }

  pub async fn transaction(&self, id: &str) -> Result<Transaction, ApiError> {
    let key = QueryKey::new(ResourceType::Transaction).param("id", id);
    self.read(&key, Request::get(format!("transactions/{}", id))).await
  }

  /// AI-categorize one transaction.
  pub async fn categorize_transaction(&self, id: &str) -> Result<Transaction, ApiError> {
    let request = Request::post(format!("categorization/transactions/{}", id));
    let mutation = Mutation::update(ResourceType::Transaction, id, request)
      .invalidating([ResourceType::CategorizationBreakdown]);
    self.mutations.mutate(mutation).await?.json()
  }

  /// Start categorizing up to `limit` uncategorized transactions.
  pub fn categorize_uncategorized(&self, limit: u32) -> BulkJob {
    self
      .bulk
      .submit(BulkOperation::CategorizeUncategorized { limit }, u64::from(limit))
  }

  pub async fn category_breakdown(&self) -> Result<CategoryBreakdown, ApiError> {
    let key = QueryKey::new(ResourceType::CategorizationBreakdown);
    self.read(&key, Request::get("categorization/breakdown")).await
  }

  // ==========================================================================
  // Bank accounts
  // ==========================================================================

  pub async fn bank_accounts(&self) -> Result<BankAccountList, ApiError> {
    let key = QueryKey::new(ResourceType::BankAccount);
    self.read(&key, Request::get("banks/")).await
  }

  pub async fn create_bank_account(&self, account: &NewBankAccount) -> Result<BankAccount, ApiError> {
    let request = Request::post("banks/").json(to_body(account)?);
    let mutation = Mutation::create(ResourceType::BankAccount, request)
      .invalidating([ResourceType::Transaction]);
    self.mutations.mutate(mutation).await?.json()
  }

  /// Pull new transactions for an account from its bank.
  pub async fn sync_bank_account(&self, id: &str) -> Result<SyncResult, ApiError> {
    let request = Request::post(format!("banks/{}/sync", id));
    let mutation = Mutation::update(ResourceType::BankAccount, id, request)
      .invalidating([ResourceType::Transaction]);
    self.mutations.mutate(mutation).await?.json()
  }

  // ==========================================================================
  // Reconciliation and reminders
  // ==========================================================================

  pub async fn reconciliation_stats(&self) -> Result<ReconciliationStats, ApiError> {
    let key = QueryKey::new(ResourceType::ReconciliationStats);
    self.read(&key, Request::get("reconciliations/stats")).await
  }

  /// Candidate invoices for a transaction. Cached under the transaction, so
  /// any transaction write refreshes them.
  pub async fn reconciliation_suggestions(
    &self,
    transaction_id: &str,
  ) -> Result<Vec<ReconciliationSuggestion>, ApiError> {
    let key = QueryKey::new(ResourceType::Transaction).param("suggestions_for", transaction_id);
    self
      .read(
        &key,
        Request::get(format!("reconciliations/suggestions/{}", transaction_id)),
      )
      .await
  }

  pub async fn create_reconciliation(
    &self,
    reconciliation: &NewReconciliation,
  ) -> Result<Reconciliation, ApiError> {
    let request = Request::post("reconciliations/").json(to_body(reconciliation)?);
    let mutation = Mutation::create(ResourceType::ReconciliationStats, request)
      .invalidating([ResourceType::Transaction, ResourceType::Invoice]);
    self.mutations.mutate(mutation).await?.json()
  }

  /// Send reminders for every overdue invoice.
  pub fn process_overdue_reminders(&self) -> BulkJob {
    self.bulk.submit(BulkOperation::ProcessOverdueReminders, 0)
  }

  // ==========================================================================
  // Plumbing
  // ==========================================================================

  async fn read<T>(&self, key: &QueryKey, request: Request) -> Result<T, ApiError>
  where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
  {
    let transport = Arc::clone(&self.transport);
    self
      .cache
      .fetch_or_serve(key, move || async move { transport.send(request).await?.json::<T>() })
      .await
  }

  fn query<T>(&self, key: QueryKey, path: &'static str) -> Query<T>
  where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
  {
    let transport = Arc::clone(&self.transport);
    let request = list_request(path, &key);
    Query::new(Arc::clone(&self.cache), key, move || {
      let transport = Arc::clone(&transport);
      let request = request.clone();
      async move { transport.send(request).await?.json::<T>() }
    })
  }
}

/// GET `path` with the key's parameters as the query string.
fn list_request(path: &str, key: &QueryKey) -> Request {
  key
    .params()
    .iter()
    .fold(Request::get(path), |request, (name, value)| request.query(name.clone(), value))
}

fn to_body(value: &impl serde::Serialize) -> Result<serde_json::Value, ApiError> {
  serde_json::to_value(value).map_err(|e| ApiError::Validation {
    detail: format!("request body could not be encoded: {}", e),
    fields: Vec::new(),
  })
}

/// Minimal server-shaped invoice, for fixtures.
#[cfg(test)]
pub(crate) fn invoice_json(id: &str, number: &str) -> serde_json::Value {
  serde_json::json!({
    "id": id,
    "invoice_number": number,
    "client_name": "ACME Corp",
    "client_email": null,
    "amount": "100.00",
    "tax_amount": "20.00",
    "total_amount": "120.00",
    "currency": "EUR",
    "issue_date": "2026-01-05",
    "due_date": "2026-02-05",
    "payment_date": null,
    "status": "pending",
    "is_reconciled": false,
    "description": null,
    "notes": null,
    "created_at": "2026-01-05T09:00:00",
    "updated_at": "2026-01-05T09:00:00"
  })
}
