// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Session and key-manager credential pair.

use std::fmt;

/// Immutable credential pair issued to an integration user.
///
/// Credentials are replaced wholesale on rotation, never edited in place.
/// [`AuthenticationToken::VOID`] stands for "never issued".
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticationToken {
    session_token: String,
    key_manager_token: String,
    issued_at_millis: i64,
}

impl AuthenticationToken {
    /// Sentinel for a user that has never been authenticated.
    pub const VOID: AuthenticationToken = AuthenticationToken {
        session_token: String::new(),
        key_manager_token: String::new(),
        issued_at_millis: 0,
    };

    pub fn new(
        session_token: impl Into<String>,
        key_manager_token: impl Into<String>,
        issued_at_millis: i64,
    ) -> Self {
        Self {
            session_token: session_token.into(),
            key_manager_token: key_manager_token.into(),
            issued_at_millis,
        }
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    pub fn key_manager_token(&self) -> &str {
        &self.key_manager_token
    }

    /// Unix time in milliseconds at which the pair was installed.
    pub fn issued_at_millis(&self) -> i64 {
        self.issued_at_millis
    }

    pub fn is_void(&self) -> bool {
        *self == Self::VOID
    }

    /// Milliseconds elapsed between issuance and `now_millis`.
    pub fn age_millis(&self, now_millis: i64) -> i64 {
        now_millis.saturating_sub(self.issued_at_millis)
    }
}

impl Default for AuthenticationToken {
    fn default() -> Self {
        Self::VOID
    }
}

// Token values never reach logs.
impl fmt::Debug for AuthenticationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_void() {
            return f.write_str("AuthenticationToken::VOID");
        }
        f.debug_struct("AuthenticationToken")
            .field("session_token", &"<redacted>")
            .field("key_manager_token", &"<redacted>")
            .field("issued_at_millis", &self.issued_at_millis)
            .finish()
    }
}
