// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API error responses.
//!
//! Every error the HTTP layer returns is an [`ApiError`]. It renders as a
//! JSON body `{"Message": "..."}` with a matching status code; quota
//! rejections also carry the current usage as `FilesSize`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::fetch::AdmitError;
use crate::registry::RegistryError;
use crate::utils::human_size;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Required query or form parameter is absent (400).
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    /// Aggregate usage is above the quota (503).
    #[error("quota exceeded")]
    QuotaExceeded { used: u64 },

    /// No record with that name (404).
    #[error("{0}")]
    NotFound(String),

    /// The record exists but cannot be acted on yet (409).
    #[error("{0}")]
    Conflict(String),

    /// Anything else (500). Details are logged, not returned.
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "FilesSize", skip_serializing_if = "Option::is_none")]
    files_size: Option<String>,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingParameter(_) => StatusCode::BAD_REQUEST,
            ApiError::QuotaExceeded { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The text placed in the `Message` field.
    pub fn message(&self) -> String {
        match self {
            ApiError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if let ApiError::Internal(detail) = &self {
            tracing::error!(detail = %detail, "Request failed");
        }

        let files_size = match &self {
            ApiError::QuotaExceeded { used } => Some(human_size(*used)),
            _ => None,
        };
        let body = ErrorBody {
            message: self.message(),
            files_size,
        };

        (status, Json(body)).into_response()
    }
}

impl From<AdmitError> for ApiError {
    fn from(err: AdmitError) -> Self {
        match err {
            AdmitError::QuotaExceeded { used } => ApiError::QuotaExceeded { used },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => ApiError::NotFound(err.to_string()),
            RegistryError::StillDownloading(_) | RegistryError::AlreadyExists(_) => {
                ApiError::Conflict(err.to_string())
            }
            RegistryError::Io { .. } => ApiError::Internal(format!("{:#}", anyhow::Error::new(err))),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}
