//! Serde types matching the dashboard API payloads.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Scalars
// ============================================================================

/// Monetary amount. The server sends decimals as strings ("2500.00") but
/// older endpoints emit plain numbers, so both are accepted.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Amount(pub f64);

impl Amount {
  pub fn value(&self) -> f64 {
    self.0
  }
}

impl fmt::Display for Amount {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(&format!("{:.2}", self.0))
  }
}

impl Serialize for Amount {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.to_string())
  }
}

impl<'de> Deserialize<'de> for Amount {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
      Number(f64),
      Text(String),
    }

    match Raw::deserialize(deserializer)? {
      Raw::Number(n) => Ok(Amount(n)),
      Raw::Text(s) => s
        .trim()
        .parse()
        .map(Amount)
        .map_err(|_| serde::de::Error::custom(format!("invalid amount: {}", s))),
    }
  }
}

/// Accept RFC 3339 timestamps and the naive `YYYY-MM-DDTHH:MM:SS[.f]` form
/// (read as UTC).
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }
  NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
    .ok()
    .map(|naive| naive.and_utc())
}

mod timestamp {
  use super::*;

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let s = String::deserialize(deserializer)?;
    parse_timestamp(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", s)))
  }

  pub mod option {
    use super::super::parse_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
      deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
      match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_timestamp(&s)
          .map(Some)
          .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", s))),
        None => Ok(None),
      }
    }
  }
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
  pub email: String,
  pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
  pub access_token: String,
  pub refresh_token: Option<String>,
  #[serde(default = "default_token_type")]
  pub token_type: String,
}

fn default_token_type() -> String {
  "bearer".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
  pub email: String,
  pub password: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub full_name: Option<String>,
  pub company_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct User {
  pub id: String,
  pub email: String,
  pub full_name: Option<String>,
  pub is_active: bool,
  #[serde(default)]
  pub is_verified: bool,
}

// ============================================================================
// Invoices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
  Pending,
  Paid,
  Overdue,
  Cancelled,
}

impl InvoiceStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      InvoiceStatus::Pending => "pending",
      InvoiceStatus::Paid => "paid",
      InvoiceStatus::Overdue => "overdue",
      InvoiceStatus::Cancelled => "cancelled",
    }
  }
}

impl fmt::Display for InvoiceStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for InvoiceStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(InvoiceStatus::Pending),
      "paid" => Ok(InvoiceStatus::Paid),
      "overdue" => Ok(InvoiceStatus::Overdue),
      "cancelled" => Ok(InvoiceStatus::Cancelled),
      other => Err(format!("unknown invoice status '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Invoice {
  pub id: String,
  pub invoice_number: String,
  pub client_name: String,
  pub client_email: Option<String>,
  pub amount: Amount,
  pub tax_amount: Amount,
  pub total_amount: Amount,
  pub currency: String,
  pub issue_date: NaiveDate,
  pub due_date: NaiveDate,
  pub payment_date: Option<NaiveDate>,
  pub status: InvoiceStatus,
  #[serde(default)]
  pub is_reconciled: bool,
  pub description: Option<String>,
  pub notes: Option<String>,
  #[serde(with = "timestamp")]
  pub created_at: DateTime<Utc>,
  #[serde(with = "timestamp")]
  pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvoiceList {
  pub invoices: Vec<Invoice>,
  pub total: u64,
  pub page: u32,
  pub page_size: u32,
  pub total_pages: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewInvoice {
  pub invoice_number: String,
  pub client_name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub client_email: Option<String>,
  pub amount: Amount,
  pub tax_amount: Amount,
  pub currency: String,
  pub issue_date: NaiveDate,
  pub due_date: NaiveDate,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

/// Partial update; only the set fields are sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvoiceUpdate {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub client_name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub amount: Option<Amount>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<NaiveDate>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<InvoiceStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

/// Filters for the invoice list. Unset fields are not sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceFilter {
  pub status: Option<InvoiceStatus>,
  pub is_reconciled: Option<bool>,
  pub client_name: Option<String>,
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Transaction {
  pub id: String,
  pub bank_account_id: String,
  #[serde(with = "timestamp")]
  pub date: DateTime<Utc>,
  pub description: String,
  pub amount: Amount,
  pub currency: String,
  pub transaction_type: Option<String>,
  pub category: Option<String>,
  pub category_confidence: Option<Amount>,
  #[serde(default)]
  pub is_reconciled: bool,
  pub reconciliation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransactionList {
  pub transactions: Vec<Transaction>,
  pub total: u64,
  pub page: u32,
  pub page_size: u32,
  pub total_pages: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFilter {
  pub bank_account_id: Option<String>,
  pub category: Option<String>,
  pub is_reconciled: Option<bool>,
  pub search: Option<String>,
}

/// `{category: total amount}`
pub type CategoryBreakdown = BTreeMap<String, Amount>;

// ============================================================================
// Bank accounts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BankAccount {
  pub id: String,
  pub bank_name: String,
  pub account_type: Option<String>,
  pub iban: Option<String>,
  pub balance: Amount,
  pub currency: String,
  pub is_active: bool,
  #[serde(default, with = "timestamp::option")]
  pub last_sync_at: Option<DateTime<Utc>>,
  pub sync_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BankAccountList {
  pub accounts: Vec<BankAccount>,
  pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewBankAccount {
  pub bank_name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub account_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub iban: Option<String>,
  pub balance: Amount,
  pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SyncResult {
  pub new_count: u64,
}

// ============================================================================
// Reconciliation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReconciliationStats {
  pub total: u64,
  #[serde(default)]
  pub by_method: BTreeMap<String, u64>,
  #[serde(default)]
  pub by_validator: BTreeMap<String, u64>,
  #[serde(default)]
  pub auto_reconciliation_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReconciliationSuggestion {
  pub transaction_id: String,
  pub invoice_id: String,
  pub match_score: Amount,
  pub match_method: String,
  pub reasoning: String,
  pub transaction_description: String,
  pub transaction_amount: Amount,
  pub invoice_number: String,
  pub invoice_amount: Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
  Exact,
  Reference,
  FuzzyAi,
  Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Validator {
  Ai,
  User,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewReconciliation {
  pub transaction_id: String,
  pub invoice_id: String,
  pub match_score: f64,
  pub match_method: MatchMethod,
  pub validated_by: Validator,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

impl NewReconciliation {
  /// Accept a suggestion as-is, validated by the user.
  pub fn from_suggestion(suggestion: &ReconciliationSuggestion) -> Self {
    let match_method = match suggestion.match_method.as_str() {
      "exact" => MatchMethod::Exact,
      "reference" => MatchMethod::Reference,
      "fuzzy_ai" => MatchMethod::FuzzyAi,
      _ => MatchMethod::Manual,
    };
    Self {
      transaction_id: suggestion.transaction_id.clone(),
      invoice_id: suggestion.invoice_id.clone(),
      match_score: suggestion.match_score.value(),
      match_method,
      validated_by: Validator::User,
      notes: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reconciliation {
  pub id: String,
  pub transaction_id: String,
  pub invoice_id: String,
  pub match_score: Amount,
  pub match_method: String,
  pub validated_by: String,
}

// ============================================================================
// Reminders
// ============================================================================

/// Outcome of `reminders/process-overdue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct OverdueReport {
  pub total: u64,
  pub sent: u64,
  pub failed: u64,
}
