//! The wire error envelope and the structured report consumed by the
//! response-logging middleware.

use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::session::ConversionError;

/// Diagnostic payload attached to error responses as an extension so the
/// logging middleware can emit the full error chain without leaking it to
/// the client.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: String,
    pub details: String,
}

/// The JSON error envelope: a short per-endpoint message plus the
/// collaborator's diagnostic text.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    short: &'static str,
    details: String,
}

impl ApiError {
    pub fn new(status: StatusCode, short: &'static str, details: impl Into<String>) -> Self {
        Self {
            status,
            short,
            details: details.into(),
        }
    }

    /// Map a conversion failure onto the envelope. `short` is the
    /// endpoint-specific headline. Bad uploads are the client's fault,
    /// unknown target formats are unprocessable, everything else is a
    /// server-side failure.
    pub fn from_conversion(short: &'static str, error: &ConversionError) -> Self {
        let status = match error {
            ConversionError::Upload { .. } => StatusCode::BAD_REQUEST,
            ConversionError::UnsupportedFormat { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ConversionError::Collaborator { .. } | ConversionError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, short, error.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.short.to_string(),
            details: self.details.clone(),
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            "http::handlers",
            self.status,
            format!("{}: {}", self.short, self.details),
        )
        .attach(&mut response);
        response
    }
}
