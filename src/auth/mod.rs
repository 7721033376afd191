// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Per-user authentication for webhook integrations.
//!
//! ## Flow
//!
//! 1. Each configured integration user is registered with its client
//!    certificate; the proxy builds one dedicated transport for it
//! 2. `authenticate` calls the session and key-manager services
//!    (`POST /v1/authenticate`) over that transport and installs both tokens
//! 3. Outbound calls attach the `sessionToken` header
//! 4. A 401 on an outbound call goes through `re_auth_or_throw` /
//!    `re_auth_session_or_throw`, which re-authenticates at most once per
//!    expired session and hands back the credential to retry with
//!
//! ## Security
//!
//! - Tokens are never written to logs
//! - A superseded session token keeps resolving for one rotation so that
//!   in-flight calls can still be traced to their user

pub mod authenticator;
pub mod context;
pub mod error;
pub mod proxy;
mod session_index;
pub mod token;

pub use authenticator::{HttpAuthenticator, RemoteAuthenticator, Token};
pub use context::{AuthenticationContext, Rotation};
pub use error::{AuthError, AuthenticatorError, ReAuthError};
pub use proxy::{AuthenticationProxy, Clock, SystemClock, DEFAULT_MAX_SESSION_AGE};
pub use token::AuthenticationToken;
