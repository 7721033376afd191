// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Reverse index from session token to integration user.
//!
//! Two generations are kept: tokens that are some user's `current`
//! credential, and tokens that are some user's `previous` credential.
//! Lookups try the current generation first, so a fresh mapping always wins
//! over a grace-period one. A token leaves the index when it falls out of its
//! user's `previous` slot or when the user is re-registered.

use std::collections::HashMap;

use super::context::Rotation;
use super::token::AuthenticationToken;

#[derive(Debug, Default)]
pub(crate) struct SessionIndex {
    current: HashMap<String, String>,
    previous: HashMap<String, String>,
}

impl SessionIndex {
    pub(crate) fn lookup(&self, session_token: &str) -> Option<&str> {
        self.current
            .get(session_token)
            .or_else(|| self.previous.get(session_token))
            .map(String::as_str)
    }

    /// Apply a credential rotation of `user_id`.
    pub(crate) fn rotate(&mut self, user_id: &str, rotation: &Rotation) {
        if let Some(token) = indexable(&rotation.expired) {
            remove_if_owned(&mut self.previous, token, user_id);
        }

        if let Some(token) = indexable(&rotation.superseded) {
            remove_if_owned(&mut self.current, token, user_id);
            self.previous.insert(token.to_string(), user_id.to_string());
        }

        if let Some(token) = indexable(&rotation.installed) {
            self.current.insert(token.to_string(), user_id.to_string());
        }
    }

    /// Forget every token still held by `user_id`.
    pub(crate) fn remove_user(
        &mut self,
        user_id: &str,
        current: &AuthenticationToken,
        previous: &AuthenticationToken,
    ) {
        for token in [current, previous].into_iter().filter_map(indexable) {
            remove_if_owned(&mut self.current, token, user_id);
            remove_if_owned(&mut self.previous, token, user_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }
}

fn indexable(token: &AuthenticationToken) -> Option<&str> {
    Some(token.session_token()).filter(|t| !t.is_empty())
}

fn remove_if_owned(map: &mut HashMap<String, String>, token: &str, user_id: &str) {
    if map.get(token).is_some_and(|owner| owner == user_id) {
        map.remove(token);
    }
}
