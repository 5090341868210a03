//! Scripted HTTP backend shared by the unit tests.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::error::ApiError;
use crate::transport::{HttpBackend, HttpRequest, HttpResponse, Method};

/// What the fake backend saw.
#[derive(Debug, Clone)]
pub struct RecordedCall {
  pub method: Method,
  pub url: Url,
  pub bearer: Option<String>,
  pub body: Option<serde_json::Value>,
}

impl RecordedCall {
  /// Path relative to `/api/v1/`.
  pub fn path(&self) -> &str {
    self
      .url
      .path()
      .trim_start_matches("/api/v1/")
  }
}

type Handler = Box<dyn Fn(&RecordedCall) -> Result<HttpResponse, ApiError> + Send + Sync>;

pub struct FakeBackend {
  calls: Mutex<Vec<RecordedCall>>,
  handler: Handler,
  delay: Duration,
}

impl FakeBackend {
  pub fn new<F>(handler: F) -> Arc<Self>
  where
    F: Fn(&RecordedCall) -> Result<HttpResponse, ApiError> + Send + Sync + 'static,
  {
    Arc::new(Self {
      calls: Mutex::new(Vec::new()),
      handler: Box::new(handler),
      delay: Duration::ZERO,
    })
  }

  /// Every response is delayed by `delay` (tokio time, so pausable).
  pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
    let mut this = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("backend already shared"));
    this.delay = delay;
    Arc::new(this)
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl HttpBackend for FakeBackend {
  fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
    let call = RecordedCall {
      method: request.method,
      url: request.url,
      bearer: request.bearer.map(|t| t.as_str().to_string()),
      body: request.body,
    };
    self.calls.lock().unwrap().push(call.clone());

    async move {
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      (self.handler)(&call)
    }
    .boxed()
  }
}

pub fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
  HttpResponse {
    status,
    body: serde_json::to_vec(&body).unwrap(),
  }
}

pub fn empty_response(status: u16) -> HttpResponse {
  HttpResponse {
    status,
    body: Vec::new(),
  }
}
