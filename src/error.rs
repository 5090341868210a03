//! Closed error taxonomy surfaced to every caller of the sync layer.
//!
//! Transport failures of any kind end up as one of the [`ApiError`] variants.
//! Nothing below the view layer decides how an error is presented; it only
//! decides which variant it is.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// A single field-level validation message, e.g. `email: value is not a valid email`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
  /// Dotted path of the offending field ("email", "items.0.amount"). Empty when
  /// the server did not attribute the message to a field.
  pub field: String,
  pub message: String,
}

/// Every failure the sync layer can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
  /// 401, or an authenticated call attempted without a token.
  #[error("not authenticated")]
  Unauthenticated,
  /// 422 (and other client-side request rejections), with field messages for display.
  #[error("validation failed: {detail}")]
  Validation {
    detail: String,
    fields: Vec<FieldError>,
  },
  #[error("not found: {detail}")]
  NotFound { detail: String },
  /// 409, e.g. a duplicate invoice number.
  #[error("conflict: {detail}")]
  Conflict { detail: String },
  #[error("server fault ({status}): {detail}")]
  ServerFault { status: u16, detail: String },
  #[error("request timed out")]
  Timeout,
  #[error("network unreachable: {reason}")]
  NetworkUnreachable { reason: String },
}

impl ApiError {
  /// Whether this error means the session is gone and the user must sign in again.
  pub fn is_unauthenticated(&self) -> bool {
    matches!(self, ApiError::Unauthenticated)
  }

  /// Error for a 2xx response whose body did not have the expected shape.
  pub fn malformed(status: u16, err: impl std::fmt::Display) -> Self {
    ApiError::ServerFault {
      status,
      detail: format!("malformed response body: {}", err),
    }
  }

  /// Map a non-2xx HTTP response onto the taxonomy.
  ///
  /// The body is expected to follow the FastAPI convention: `{"detail": "..."}`,
  /// or for 422 `{"detail": [{"loc": [...], "msg": "..."}]}`. Anything else
  /// falls back to the raw body text.
  pub fn from_status(status: u16, body: &[u8]) -> Self {
    let (detail, fields) = parse_detail(body);
    let detail = if detail.is_empty() {
      default_detail(status).to_string()
    } else {
      detail
    };

    match status {
      401 => ApiError::Unauthenticated,
      404 => ApiError::NotFound { detail },
      409 => ApiError::Conflict { detail },
      400..=499 => ApiError::Validation { detail, fields },
      _ => ApiError::ServerFault { status, detail },
    }
  }
}

fn default_detail(status: u16) -> &'static str {
  match status {
    404 => "resource not found",
    409 => "resource already exists",
    422 => "invalid input",
    400..=499 => "request rejected",
    _ => "unexpected server error",
  }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
  #[serde(default)]
  detail: Value,
}

#[derive(Debug, Deserialize)]
struct ValidationItem {
  #[serde(default)]
  loc: Vec<Value>,
  #[serde(default)]
  msg: String,
}

/// Extract a human-readable detail string and any per-field messages.
fn parse_detail(body: &[u8]) -> (String, Vec<FieldError>) {
  let parsed: ErrorBody = match serde_json::from_slice(body) {
    Ok(parsed) => parsed,
    Err(_) => return (String::from_utf8_lossy(body).trim().to_string(), Vec::new()),
  };

  match parsed.detail {
    Value::String(s) => (s, Vec::new()),
    Value::Array(items) => {
      let fields: Vec<FieldError> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<ValidationItem>(item).ok())
        .map(|item| FieldError {
          field: field_path(&item.loc),
          message: item.msg,
        })
        .collect();
      let detail = fields
        .iter()
        .map(|f| {
          if f.field.is_empty() {
            f.message.clone()
          } else {
            format!("{}: {}", f.field, f.message)
          }
        })
        .collect::<Vec<_>>()
        .join("; ");
      (detail, fields)
    }
    Value::Null => (String::new(), Vec::new()),
    other => (other.to_string(), Vec::new()),
  }
}

/// Join a FastAPI `loc` array into a dotted path, dropping the leading
/// "body"/"query"/"path" segment.
fn field_path(loc: &[Value]) -> String {
  loc
    .iter()
    .enumerate()
    .filter(|(i, seg)| {
      !(*i == 0 && matches!(seg.as_str(), Some("body" | "query" | "path" | "header")))
    })
    .map(|(_, seg)| match seg {
      Value::String(s) => s.clone(),
      other => other.to_string(),
    })
    .collect::<Vec<_>>()
    .join(".")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_mapping() {
    assert_eq!(ApiError::from_status(401, b""), ApiError::Unauthenticated);
    assert!(matches!(
      ApiError::from_status(404, b"{\"detail\":\"Invoice not found\"}"),
      ApiError::NotFound { detail } if detail == "Invoice not found"
    ));
    assert!(matches!(
      ApiError::from_status(409, b"{\"detail\":\"Invoice number already exists\"}"),
      ApiError::Conflict { .. }
    ));
    assert!(matches!(
      ApiError::from_status(503, b"upstream down"),
      ApiError::ServerFault { status: 503, detail } if detail == "upstream down"
    ));
  }

  #[test]
  fn test_validation_fields_are_flattened() {
    let body = br#"{"detail":[
      {"loc":["body","email"],"msg":"value is not a valid email address","type":"value_error"},
      {"loc":["body","amount"],"msg":"Input should be greater than 0","type":"greater_than"}
    ]}"#;

    match ApiError::from_status(422, body) {
      ApiError::Validation { detail, fields } => {
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field, "email");
        assert_eq!(fields[1].field, "amount");
        assert!(detail.starts_with("email: value is not a valid email address"));
      }
      other => panic!("expected validation error, got {:?}", other),
    }
  }

  #[test]
  fn test_bad_request_maps_to_validation() {
    let err = ApiError::from_status(400, b"{\"detail\":\"Invalid invoice ID\"}");
    assert_eq!(
      err,
      ApiError::Validation {
        detail: "Invalid invoice ID".to_string(),
        fields: Vec::new(),
      }
    );
  }

  #[test]
  fn test_unauthenticated_survives_eyre_wrapping() {
    let report = color_eyre::eyre::Report::new(ApiError::from_status(401, b""));
    assert!(report
      .downcast_ref::<ApiError>()
      .is_some_and(ApiError::is_unauthenticated));

    let report = color_eyre::eyre::Report::new(ApiError::Timeout);
    assert!(!report
      .downcast_ref::<ApiError>()
      .is_some_and(ApiError::is_unauthenticated));
  }

  #[test]
  fn test_empty_body_uses_default_detail() {
    assert_eq!(
      ApiError::from_status(500, b""),
      ApiError::ServerFault {
        status: 500,
        detail: "unexpected server error".to_string(),
      }
    );
  }
}
