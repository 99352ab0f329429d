//! Error types: per-call backend failures and the service-level `AppError`
//! (which renders itself as a JSON HTTP response).

use axum::{
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::domain::BackendKind;
use crate::flow::FlowError;

/// Failure of a single backend invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
  #[error("{0} backend is not configured")]
  NotConfigured(BackendKind),

  #[error("HTTP transport error: {0}")]
  Http(String),

  #[error("timed out after {0}s")]
  Timeout(u64),

  #[error("HTTP {status}: {message}")]
  Status { status: u16, message: String },

  #[error("malformed response: {0}")]
  MalformedResponse(String),
}

/// One failed step of a fallback chain.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackendFailure {
  pub backend: BackendKind,
  pub error: String,
}

#[derive(Error, Debug)]
pub enum AppError {
  #[error("question content is missing")]
  MissingContent,

  #[error("invalid input: {0}")]
  InvalidInput(String),

  #[error("question {id} not found")]
  NotFound { id: String },

  #[error("question {id} belongs to another user")]
  Forbidden { id: String },

  #[error("all {} backends in the routing chain failed", attempts.len())]
  BackendExhausted { attempts: Vec<BackendFailure> },

  #[error(transparent)]
  Flow(#[from] FlowError),
}

impl AppError {
  pub fn code(&self) -> &'static str {
    match self {
      AppError::MissingContent => "missing_content",
      AppError::InvalidInput(_) => "invalid_input",
      AppError::NotFound { .. } => "not_found",
      AppError::Forbidden { .. } => "forbidden",
      AppError::BackendExhausted { .. } => "backend_exhausted",
      AppError::Flow(_) => "invalid_transition",
    }
  }

  pub fn status_code(&self) -> StatusCode {
    match self {
      AppError::MissingContent | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
      AppError::NotFound { .. } => StatusCode::NOT_FOUND,
      AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
      AppError::BackendExhausted { .. } => StatusCode::BAD_GATEWAY,
      AppError::Flow(_) => StatusCode::CONFLICT,
    }
  }
}

impl IntoResponse for AppError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    let code = self.code();
    let message = self.to_string();

    match &self {
      AppError::BackendExhausted { attempts } => {
        tracing::error!(target: "cuotiben_backend", code, attempts = attempts.len(), %message, "Backend chain exhausted");
      }
      _ => {
        tracing::debug!(target: "cuotiben_backend", code, %message, "Client error");
      }
    }

    let attempts = match &self {
      AppError::BackendExhausted { attempts } => Some(attempts.clone()),
      _ => None,
    };

    let body = Json(json!({
      "error": {
        "code": code,
        "status": status.as_u16(),
        "message": message,
        "attempts": attempts,
      }
    }));
    (status, body).into_response()
  }
}
