// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use reqwest::StatusCode;
use tracing::debug;

use crate::auth::{AuthError, ReAuthError};
use crate::config::ServiceName;

/// Boxed error used where the concrete cause depends on the collaborator.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A remote endpoint answered with a non-success status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("remote call returned {status}: {message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Consume a failed response, keeping its body as the message.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(status = %status, error = %e, "Failed to read error response body");
                String::new()
            }
        };
        if body.trim().is_empty() {
            Self::new(status, "error")
        } else {
            Self::new(status, body)
        }
    }
}

/// Failure of a decorated outbound call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("could not reach the {service} service: {source}")]
    Connectivity {
        service: ServiceName,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid response from the {service} service: {message}")]
    InvalidResponse {
        service: ServiceName,
        message: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ClientError {
    /// HTTP status of the remote failure, when there was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Api(e) => Some(e.status),
            _ => None,
        }
    }
}

impl From<ReAuthError<ApiError>> for ClientError {
    fn from(err: ReAuthError<ApiError>) -> Self {
        match err {
            ReAuthError::Rejected(cause) => ClientError::Api(cause),
            ReAuthError::Auth(auth) => ClientError::Auth(auth),
        }
    }
}
