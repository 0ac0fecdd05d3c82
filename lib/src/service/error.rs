/*
 * Description: Map failures of the http layer onto status codes and a json
 * error body.
 *
 * Copyright (C) 2023 Danny McClanahan <dmcC2@hypnicjerk.ai>
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

use crate::{progress::ProgressError, NameFormatError};

use axum::{
  extract::{
    multipart::{MultipartError, MultipartRejection},
    rejection::{JsonRejection, QueryRejection},
  },
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use displaydoc::Display;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Display, Error)]
pub enum ServiceError {
  /// {0}
  BadRequest(String),
  /// {0}
  Conflict(String),
  /// {0}
  PayloadTooLarge(String),
  /// {0}
  UnsupportedMediaType(String),
  /// {0}
  Internal(String),
}

impl ServiceError {
  pub fn status(&self) -> StatusCode {
    match self {
      Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Conflict(_) => StatusCode::CONFLICT,
      Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
      Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
      Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  /// Classify an extractor rejection by the status axum would have used.
  fn from_status(status: StatusCode, message: String) -> Self {
    match status {
      StatusCode::PAYLOAD_TOO_LARGE => Self::PayloadTooLarge(message),
      StatusCode::UNSUPPORTED_MEDIA_TYPE => Self::UnsupportedMediaType(message),
      s if s.is_server_error() => Self::Internal(message),
      _ => Self::BadRequest(message),
    }
  }
}

impl IntoResponse for ServiceError {
  fn into_response(self) -> Response {
    let status = self.status();
    let message = self.to_string();
    if status.is_server_error() {
      error!(%status, error = %message);
    } else {
      warn!(%status, error = %message);
    }
    (status, Json(json!({ "error": message }))).into_response()
  }
}

impl From<ProgressError> for ServiceError {
  fn from(e: ProgressError) -> Self { Self::Conflict(e.to_string()) }
}

impl From<NameFormatError> for ServiceError {
  fn from(e: NameFormatError) -> Self { Self::BadRequest(format!("invalid entry name: {}", e)) }
}

impl From<JsonRejection> for ServiceError {
  fn from(e: JsonRejection) -> Self { Self::from_status(e.status(), e.body_text()) }
}

impl From<QueryRejection> for ServiceError {
  fn from(e: QueryRejection) -> Self { Self::from_status(e.status(), e.body_text()) }
}

impl From<MultipartRejection> for ServiceError {
  fn from(e: MultipartRejection) -> Self { Self::from_status(e.status(), e.body_text()) }
}

impl From<MultipartError> for ServiceError {
  fn from(e: MultipartError) -> Self { Self::from_status(e.status(), e.body_text()) }
}

impl From<std::io::Error> for ServiceError {
  fn from(e: std::io::Error) -> Self { Self::Internal(e.to_string()) }
}
