// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication errors.

use reqwest::StatusCode;

use crate::config::ServiceName;
use crate::error::{ApiError, BoxError};
use crate::tls::TlsError;

/// Authentication proxy error type.
///
/// Registration mistakes (`UnregisteredUser`, `UnregisteredSessionToken`)
/// are configuration bugs and are never retried. The remaining variants
/// classify a failed call to the remote authentication services.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("user {user_id} is not registered with the authentication proxy")]
    UnregisteredUser { user_id: String },

    #[error("session token is not registered with the authentication proxy")]
    UnregisteredSessionToken,

    #[error("could not reach the {service} service: {source}")]
    Connectivity {
        service: ServiceName,
        #[source]
        source: BoxError,
    },

    #[error("authentication of user {user_id} was rejected; verify the user certificate")]
    Unauthorized {
        user_id: String,
        #[source]
        source: ApiError,
    },

    #[error("user {user_id} is no longer entitled to authenticate; verify the user account")]
    Forbidden {
        user_id: String,
        #[source]
        source: ApiError,
    },

    #[error("unexpected failure authenticating user {user_id}: {source}")]
    Unexpected {
        user_id: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to build the transport for user {user_id}: {source}")]
    Transport {
        user_id: String,
        #[source]
        source: TlsError,
    },
}

impl AuthError {
    pub(crate) fn unregistered_user(user_id: &str) -> Self {
        AuthError::UnregisteredUser {
            user_id: user_id.to_string(),
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::UnregisteredUser { .. } => "unregistered_user",
            AuthError::UnregisteredSessionToken => "unregistered_session_token",
            AuthError::Connectivity { .. } => "connectivity_error",
            AuthError::Unauthorized { .. } => "unauthorized",
            AuthError::Forbidden { .. } => "forbidden",
            AuthError::Unexpected { .. } => "unexpected_auth_error",
            AuthError::Transport { .. } => "transport_error",
        }
    }

    /// Get the HTTP status code a caller should report for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AuthError::Connectivity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::UnregisteredUser { .. }
            | AuthError::UnregisteredSessionToken
            | AuthError::Unexpected { .. }
            | AuthError::Transport { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, AuthError::Connectivity { .. })
    }
}

/// Failure reported by a [`RemoteAuthenticator`](super::RemoteAuthenticator).
#[derive(Debug, thiserror::Error)]
pub enum AuthenticatorError {
    /// The service could not be reached (I/O, TLS handshake, timeout).
    #[error("could not reach the {service} service: {source}")]
    Connectivity {
        service: ServiceName,
        #[source]
        source: BoxError,
    },

    /// The service answered with a non-success status.
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("unexpected authentication failure: {0}")]
    Other(#[source] BoxError),
}

impl AuthenticatorError {
    /// Map to the proxy taxonomy for `user_id`.
    pub(crate) fn classify(self, user_id: &str) -> AuthError {
        let user_id = user_id.to_string();
        match self {
            AuthenticatorError::Connectivity { service, source } => {
                AuthError::Connectivity { service, source }
            }
            AuthenticatorError::Api(source) if source.status == StatusCode::UNAUTHORIZED => {
                AuthError::Unauthorized { user_id, source }
            }
            AuthenticatorError::Api(source) if source.status == StatusCode::FORBIDDEN => {
                AuthError::Forbidden { user_id, source }
            }
            AuthenticatorError::Api(source) => AuthError::Unexpected {
                user_id,
                source: Box::new(source),
            },
            AuthenticatorError::Other(source) => AuthError::Unexpected { user_id, source },
        }
    }
}

/// Outcome of a failed re-authentication decision.
#[derive(Debug, thiserror::Error)]
pub enum ReAuthError<E> {
    /// The failure was not an expired session; the caller's error, unchanged.
    #[error(transparent)]
    Rejected(E),

    /// Re-authenticating the user failed.
    #[error(transparent)]
    Auth(AuthError),
}

impl<E> From<AuthError> for ReAuthError<E> {
    fn from(err: AuthError) -> Self {
        ReAuthError::Auth(err)
    }
}
