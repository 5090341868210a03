//! Cache identities: resource types, query keys and invalidation patterns.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Coarse category of server-owned data; the unit of invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
  Invoice,
  Transaction,
  BankAccount,
  CategorizationBreakdown,
  ReconciliationStats,
}

impl ResourceType {
  pub const ALL: [ResourceType; 5] = [
    ResourceType::Invoice,
    ResourceType::Transaction,
    ResourceType::BankAccount,
    ResourceType::CategorizationBreakdown,
    ResourceType::ReconciliationStats,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceType::Invoice => "invoices",
      ResourceType::Transaction => "transactions",
      ResourceType::BankAccount => "bank_accounts",
      ResourceType::CategorizationBreakdown => "categorization_breakdown",
      ResourceType::ReconciliationStats => "reconciliation_stats",
    }
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Identity of one cacheable read: a resource type plus its parameters.
///
/// Equality is structural. Parameters are kept sorted, so insertion order
/// does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
  resource: ResourceType,
  params: BTreeMap<String, String>,
}

impl QueryKey {
  pub fn new(resource: ResourceType) -> Self {
    Self {
      resource,
      params: BTreeMap::new(),
    }
  }

  /// Add a parameter. Empty values are dropped so that "no search" and
  /// "search=''" are the same query.
  pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    let value = value.to_string();
    if !value.is_empty() {
      self.params.insert(name.into(), value);
    }
    self
  }

  /// Add a parameter only when present.
  pub fn param_opt(self, name: impl Into<String>, value: Option<impl ToString>) -> Self {
    match value {
      Some(v) => self.param(name, v),
      None => self,
    }
  }

  pub fn resource(&self) -> ResourceType {
    self.resource
  }

  pub fn params(&self) -> &BTreeMap<String, String> {
    &self.params
  }

  /// Stable, fixed-length identifier for log correlation.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.resource)?;
    for (i, (k, v)) in self.params.iter().enumerate() {
      let sep = if i == 0 { '?' } else { '&' };
      write!(f, "{}{}={}", sep, k, v)?;
    }
    Ok(())
  }
}

/// Predicate over query keys: a resource type and an optional parameter subset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPattern {
  resource: ResourceType,
  params: BTreeMap<String, String>,
}

impl InvalidationPattern {
  /// Match every key of `resource`.
  pub fn resource(resource: ResourceType) -> Self {
    Self {
      resource,
      params: BTreeMap::new(),
    }
  }

  /// Narrow to keys carrying this parameter value.
  pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.params.insert(name.into(), value.to_string());
    self
  }

  pub fn matches(&self, key: &QueryKey) -> bool {
    key.resource == self.resource
      && self
        .params
        .iter()
        .all(|(k, v)| key.params.get(k) == Some(v))
  }
}

impl From<ResourceType> for InvalidationPattern {
  fn from(resource: ResourceType) -> Self {
    Self::resource(resource)
  }
}
