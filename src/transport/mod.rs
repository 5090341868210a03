//! Outbound HTTP: credential stamping, timeouts, 401 handling.
//!
//! [`Transport`] is the only component that talks to the network. The raw
//! I/O sits behind [`HttpBackend`] so the rest of the crate can be exercised
//! against scripted backends.

mod http;

pub use http::ReqwestBackend;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::ApiError;
use crate::session::{AccessToken, SessionStore, SignOutReason};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Patch,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Patch => "PATCH",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Whether a request needs the session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
  /// Must carry a bearer token. Without one the call fails locally.
  Required,
  /// Login and registration.
  Anonymous,
}

/// A request as built by callers. Paths are relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub auth: AuthMode,
}

impl Request {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      auth: AuthMode::Required,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::Post, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::Patch, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::Delete, path)
  }

  pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.query.push((key.into(), value.to_string()));
    self
  }

  pub fn json(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn anonymous(mut self) -> Self {
    self.auth = AuthMode::Anonymous;
    self
  }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub body: Vec<u8>,
}

impl Response {
  /// Decode the body as JSON. An empty body decodes as `null`.
  pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
    let body: &[u8] = if self.body.is_empty() {
      b"null"
    } else {
      &self.body
    };
    serde_json::from_slice(body).map_err(|e| ApiError::malformed(self.status, e))
  }
}

/// A fully resolved request handed to the backend.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub bearer: Option<AccessToken>,
  pub body: Option<Value>,
}

/// Whatever came back over the wire, any status.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

/// Raw HTTP I/O.
///
/// Implementations only report transport-level failures (`Timeout`,
/// `NetworkUnreachable`); status codes are interpreted by [`Transport`].
pub trait HttpBackend: Send + Sync {
  fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>>;
}

/// Sends requests on behalf of the rest of the crate.
pub struct Transport {
  backend: Arc<dyn HttpBackend>,
  base_url: Url,
  session: Arc<SessionStore>,
  timeout: Duration,
}

impl Transport {
  pub fn new(backend: Arc<dyn HttpBackend>, base_url: Url, session: Arc<SessionStore>) -> Self {
    Self {
      backend,
      base_url: normalize_base(base_url),
      session,
      timeout: DEFAULT_TIMEOUT,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Send a request and classify the outcome.
  ///
  /// - `Required` requests without a token fail with `Unauthenticated` and never
  ///   touch the network
  /// - a 401 on a request that carried a token clears that session
  /// - nothing is retried
  pub async fn send(&self, request: Request) -> Result<Response, ApiError> {
    let bearer = match request.auth {
      AuthMode::Required => match self.session.token() {
        Some(token) => Some(token),
        None => {
          debug!(method = %request.method, path = %request.path, "no session, request not sent");
          return Err(ApiError::Unauthenticated);
        }
      },
      AuthMode::Anonymous => None,
    };

    let url = self.resolve(&request)?;
    let method = request.method;
    let path = request.path;

    let http_request = HttpRequest {
      method,
      url,
      bearer: bearer.clone(),
      body: request.body,
    };

    debug!(%method, %path, "sending request");
    let response = match tokio::time::timeout(self.timeout, self.backend.execute(http_request)).await
    {
      Ok(Ok(response)) => response,
      Ok(Err(e)) => {
        warn!(%method, %path, error = %e, "request failed");
        return Err(e);
      }
      Err(_) => {
        warn!(%method, %path, timeout = ?self.timeout, "request timed out");
        return Err(ApiError::Timeout);
      }
    };

    let status = response.status;
    debug!(%method, %path, status, "response received");

    if (200..300).contains(&status) {
      return Ok(Response {
        status,
        body: response.body,
      });
    }

    if status == 401 {
      if let Some(token) = &bearer {
        warn!(%method, %path, "token rejected, signing out");
        self
          .session
          .clear_if_current(token, SignOutReason::Unauthenticated);
      }
      return Err(ApiError::Unauthenticated);
    }

    Err(ApiError::from_status(status, &response.body))
  }

  fn resolve(&self, request: &Request) -> Result<Url, ApiError> {
    let path = request.path.trim_start_matches('/');
    let mut url = self
      .base_url
      .join(path)
      .map_err(|e| ApiError::Validation {
        detail: format!("invalid request path '{}': {}", request.path, e),
        fields: Vec::new(),
      })?;

    if !request.query.is_empty() {
      url
        .query_pairs_mut()
        .extend_pairs(request.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    Ok(url)
  }
}

/// `Url::join` drops the last segment unless the base ends with '/'.
fn normalize_base(mut url: Url) -> Url {
  if !url.path().ends_with('/') {
    let path = format!("{}/", url.path());
    url.set_path(&path);
  }
  url
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::{NoopTokenStorage, Session, SessionState};
  use crate::testing::{json_response, FakeBackend};

  fn transport(backend: Arc<FakeBackend>, session: Arc<SessionStore>) -> Transport {
    Transport::new(
      backend,
      Url::parse("http://api.test/api/v1").unwrap(),
      session,
    )
  }

  fn signed_in() -> Arc<SessionStore> {
    let session = Arc::new(SessionStore::new(Box::new(NoopTokenStorage)));
    session.set(Session::new(AccessToken::new("tok")));
    session
  }

  #[tokio::test]
  async fn test_attaches_bearer_and_resolves_url() {
    let backend = FakeBackend::new(|_| Ok(json_response(200, serde_json::json!({"ok": true}))));
    let transport = transport(backend.clone(), signed_in());

    let response = transport
      .send(Request::get("invoices/").query("page", 2).query("search", "acme"))
      .await
      .unwrap();
    assert_eq!(response.status, 200);

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
      calls[0].url.as_str(),
      "http://api.test/api/v1/invoices/?page=2&search=acme"
    );
    assert_eq!(calls[0].bearer.as_deref(), Some("tok"));
  }

  #[tokio::test]
  async fn test_missing_token_short_circuits() {
    let backend = FakeBackend::new(|_| Ok(json_response(200, serde_json::json!({}))));
    let session = Arc::new(SessionStore::new(Box::new(NoopTokenStorage)));
    let transport = transport(backend.clone(), session);

    let err = transport.send(Request::get("auth/me")).await.unwrap_err();
    assert_eq!(err, ApiError::Unauthenticated);
    assert_eq!(backend.call_count(), 0);
  }

  #[tokio::test]
  async fn test_anonymous_request_has_no_header() {
    let backend = FakeBackend::new(|_| {
      Ok(json_response(200, serde_json::json!({"access_token": "x"})))
    });
    let transport = transport(backend.clone(), signed_in());

    transport
      .send(Request::post("auth/login").anonymous())
      .await
      .unwrap();
    assert_eq!(backend.calls()[0].bearer, None);
  }

  #[tokio::test]
  async fn test_401_clears_session() {
    let backend = FakeBackend::new(|_| Ok(json_response(401, serde_json::json!({"detail": "expired"}))));
    let session = signed_in();
    let transport = transport(backend.clone(), session.clone());

    let err = transport.send(Request::get("transactions/")).await.unwrap_err();
    assert_eq!(err, ApiError::Unauthenticated);
    assert_eq!(session.get(), SessionState::Absent);

    // No further authenticated call reaches the network
    let err = transport.send(Request::get("transactions/")).await.unwrap_err();
    assert_eq!(err, ApiError::Unauthenticated);
    assert_eq!(backend.call_count(), 1);
  }

  #[tokio::test]
  async fn test_401_on_login_keeps_session() {
    let backend = FakeBackend::new(|_| Ok(json_response(401, serde_json::json!({"detail": "bad"}))));
    let session = signed_in();
    let transport = transport(backend, session.clone());

    let err = transport
      .send(Request::post("auth/login").anonymous())
      .await
      .unwrap_err();
    assert_eq!(err, ApiError::Unauthenticated);
    assert!(session.get().is_active());
  }

  #[tokio::test]
  async fn test_error_statuses_are_normalized() {
    let backend = FakeBackend::new(|_| {
      Ok(json_response(404, serde_json::json!({"detail": "Invoice not found"})))
    });
    let transport = transport(backend, signed_in());

    let err = transport.send(Request::get("invoices/x")).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout() {
    let backend = FakeBackend::new(|_| Ok(json_response(200, serde_json::json!({}))))
      .with_delay(Duration::from_secs(60));
    let transport = transport(backend, signed_in());

    let err = transport.send(Request::get("banks/")).await.unwrap_err();
    assert_eq!(err, ApiError::Timeout);
  }

  #[test]
  fn test_empty_body_decodes_as_unit() {
    let response = Response {
      status: 204,
      body: Vec::new(),
    };
    let value: Option<Value> = response.json().unwrap();
    assert!(value.is_none());
  }
}
