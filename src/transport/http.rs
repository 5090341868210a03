//! reqwest-backed [`HttpBackend`].

use futures::future::BoxFuture;
use futures::FutureExt;
use std::time::Duration;

use super::{HttpBackend, HttpRequest, HttpResponse, Method};
use crate::error::ApiError;

/// HTTP backend over a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestBackend {
  client: reqwest::Client,
}

impl ReqwestBackend {
  pub fn new(timeout: Duration) -> Result<Self, ApiError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(concat!("flowto/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| ApiError::NetworkUnreachable {
        reason: format!("failed to build HTTP client: {}", e),
      })?;

    Ok(Self { client })
  }

  async fn run(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
    let method = match request.method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Patch => reqwest::Method::PATCH,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    };

    let mut builder = self
      .client
      .request(method, request.url)
      .header(reqwest::header::ACCEPT, "application/json");

    if let Some(token) = &request.bearer {
      builder = builder.bearer_auth(token.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(classify)?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(classify)?;

    Ok(HttpResponse {
      status,
      body: body.to_vec(),
    })
  }
}

impl HttpBackend for ReqwestBackend {
  fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
    self.run(request).boxed()
  }
}

fn classify(err: reqwest::Error) -> ApiError {
  if err.is_timeout() {
    ApiError::Timeout
  } else {
    ApiError::NetworkUnreachable {
      reason: err.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::AccessToken;
  use url::Url;
  use wiremock::matchers::{body_json, header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_sends_bearer_query_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v1/categorization/bulk"))
      .and(query_param("limit", "50"))
      .and(header("authorization", "Bearer secret"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"categorized": 12})))
      .expect(1)
      .mount(&server)
      .await;

    let backend = ReqwestBackend::new(Duration::from_secs(5)).unwrap();
    let url = Url::parse(&format!("{}/api/v1/categorization/bulk?limit=50", server.uri())).unwrap();

    let response = backend
      .execute(HttpRequest {
        method: Method::Post,
        url,
        bearer: Some(AccessToken::new("secret")),
        body: None,
      })
      .await
      .unwrap();

    assert_eq!(response.status, 200);
    let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(value["categorized"], 12);
  }

  #[tokio::test]
  async fn test_error_status_is_returned_not_raised() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/v1/auth/register"))
      .and(body_json(serde_json::json!({"email": "bad"})))
      .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
        "detail": [{"loc": ["body", "email"], "msg": "invalid email"}]
      })))
      .mount(&server)
      .await;

    let backend = ReqwestBackend::new(Duration::from_secs(5)).unwrap();
    let url = Url::parse(&format!("{}/api/v1/auth/register", server.uri())).unwrap();

    let response = backend
      .execute(HttpRequest {
        method: Method::Post,
        url,
        bearer: None,
        body: Some(serde_json::json!({"email": "bad"})),
      })
      .await
      .unwrap();

    assert_eq!(response.status, 422);
  }

  #[tokio::test]
  async fn test_slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
      .mount(&server)
      .await;

    let backend = ReqwestBackend::new(Duration::from_millis(100)).unwrap();
    let url = Url::parse(&format!("{}/api/v1/banks/", server.uri())).unwrap();

    let err = backend
      .execute(HttpRequest {
        method: Method::Get,
        url,
        bearer: None,
        body: None,
      })
      .await
      .unwrap_err();

    assert_eq!(err, ApiError::Timeout);
  }

  #[tokio::test]
  async fn test_unreachable_host() {
    let backend = ReqwestBackend::new(Duration::from_secs(1)).unwrap();
    let url = Url::parse("http://127.0.0.1:9/api/v1/banks/").unwrap();

    let err = backend
      .execute(HttpRequest {
        method: Method::Get,
        url,
        bearer: None,
        body: None,
      })
      .await
      .unwrap_err();

    assert!(matches!(err, ApiError::NetworkUnreachable { .. }));
  }
}
