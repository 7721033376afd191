// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-user authentication state.
//!
//! An [`AuthenticationContext`] pairs an integration user with the HTTP
//! client built for it at registration and with its credential state:
//!
//! - `current`: the credential attached to outbound calls
//! - `previous`: the credential `current` replaced at the last rotation,
//!   kept so in-flight calls holding it can still be traced to this user
//! - `valid`: whether `current` may be used without re-authenticating
//!
//! All three are guarded by one lock and change together.

use std::sync::{PoisonError, RwLock};

use reqwest::Client;

use super::token::AuthenticationToken;

#[derive(Debug)]
struct CredentialState {
    current: AuthenticationToken,
    previous: AuthenticationToken,
    valid: bool,
}

/// Credentials moved by one successful rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    /// The credential now in `current`
    pub installed: AuthenticationToken,
    /// The former `current`, now in `previous`
    pub superseded: AuthenticationToken,
    /// The former `previous`, no longer held by the context
    pub expired: AuthenticationToken,
}

/// Credential state and owned transport of one integration user.
#[derive(Debug)]
pub struct AuthenticationContext {
    user_id: String,
    transport: Client,
    state: RwLock<CredentialState>,
}

impl AuthenticationContext {
    pub fn new(user_id: impl Into<String>, transport: Client) -> Self {
        Self {
            user_id: user_id.into(),
            transport,
            state: RwLock::new(CredentialState {
                current: AuthenticationToken::VOID,
                previous: AuthenticationToken::VOID,
                valid: false,
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The client built for this user at registration.
    pub fn transport(&self) -> &Client {
        &self.transport
    }

    /// Install a new credential.
    ///
    /// A void credential only clears the validity flag and leaves both stored
    /// credentials in place. Any other credential shifts `current` into
    /// `previous`, becomes `current`, and marks the context valid.
    pub fn set_credential(&self, token: AuthenticationToken) -> Option<Rotation> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if token.is_void() {
            state.valid = false;
            return None;
        }

        let superseded = std::mem::replace(&mut state.current, token.clone());
        let expired = std::mem::replace(&mut state.previous, superseded.clone());
        state.valid = true;

        Some(Rotation {
            installed: token,
            superseded,
            expired,
        })
    }

    pub fn current(&self) -> AuthenticationToken {
        self.read(|state| state.current.clone())
    }

    pub fn previous(&self) -> AuthenticationToken {
        self.read(|state| state.previous.clone())
    }

    /// Consistent snapshot of `(current, previous)`.
    pub fn tokens(&self) -> (AuthenticationToken, AuthenticationToken) {
        self.read(|state| (state.current.clone(), state.previous.clone()))
    }

    pub fn is_authenticated(&self) -> bool {
        self.read(|state| state.valid)
    }

    /// Mark the credential as unusable without forgetting it.
    pub fn invalidate(&self) {
        self.set_credential(AuthenticationToken::VOID);
    }

    fn read<T>(&self, f: impl FnOnce(&CredentialState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }
}
