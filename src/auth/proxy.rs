// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Proxy
//!
//! Process-wide registry of integration users. For each registered user the
//! proxy owns one [`AuthenticationContext`] (credential pair plus a dedicated
//! transport) and coordinates authentication against the session and
//! key-manager services.
//!
//! ## Locking
//!
//! - `sessions` guards the reverse index from session token to user id
//! - `contexts` guards the registry map
//! - each context guards its own credential state
//!
//! Nested locks are taken in that order and none is held across an `.await`.
//! The re-authentication decision runs under `re_auth_lock`, an async mutex
//! that is only taken on the 401 recovery path, so reads such as
//! [`AuthenticationProxy::get_token`] never wait on a remote call.
//!
//! ## Re-authentication throttle
//!
//! A 401 only triggers re-authentication when the user's current credential
//! is at least `max_session_age` old (3 minutes by default). Concurrent
//! callers that lose the race find a freshly issued credential and return
//! without a second remote call.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::authenticator::RemoteAuthenticator;
use super::context::AuthenticationContext;
use super::error::{AuthError, ReAuthError};
use super::session_index::SessionIndex;
use super::token::AuthenticationToken;
use crate::tls::{Keystore, TransportFactory};

/// Minimum credential age before a 401 is treated as an expired session.
pub const DEFAULT_MAX_SESSION_AGE: Duration = Duration::from_secs(3 * 60);

/// Source of the current time in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

pub struct AuthenticationProxy {
    sessions: RwLock<SessionIndex>,
    contexts: RwLock<HashMap<String, Arc<AuthenticationContext>>>,
    transport_factory: TransportFactory,
    session_auth: Arc<dyn RemoteAuthenticator>,
    key_manager_auth: Arc<dyn RemoteAuthenticator>,
    re_auth_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    max_session_age: Duration,
}

impl AuthenticationProxy {
    pub fn new(
        transport_factory: TransportFactory,
        session_auth: Arc<dyn RemoteAuthenticator>,
        key_manager_auth: Arc<dyn RemoteAuthenticator>,
    ) -> Self {
        Self {
            sessions: RwLock::new(SessionIndex::default()),
            contexts: RwLock::new(HashMap::new()),
            transport_factory,
            session_auth,
            key_manager_auth,
            re_auth_lock: Mutex::new(()),
            clock: Arc::new(SystemClock),
            max_session_age: DEFAULT_MAX_SESSION_AGE,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the credential age past which a 401 triggers re-authentication.
    pub fn with_max_session_age(mut self, max_session_age: Duration) -> Self {
        self.max_session_age = max_session_age;
        self
    }

    pub fn max_session_age(&self) -> Duration {
        self.max_session_age
    }

    /// Register `user_id` with a freshly built transport.
    ///
    /// Replaces any previous registration of the same user. Session tokens of
    /// the replaced context stop resolving; its transport is dropped once the
    /// last in-flight caller releases it.
    pub fn register_user(
        &self,
        user_id: &str,
        keystore: Option<&Keystore>,
    ) -> Result<(), AuthError> {
        let transport = self
            .transport_factory
            .build(keystore)
            .map_err(|source| AuthError::Transport {
                user_id: user_id.to_string(),
                source,
            })?;
        let context = Arc::new(AuthenticationContext::new(user_id, transport));

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(replaced) = contexts.insert(user_id.to_string(), context) {
            let (current, previous) = replaced.tokens();
            sessions.remove_user(user_id, &current, &previous);
            info!(user_id = %user_id, "Integration user re-registered");
        } else {
            info!(
                user_id = %user_id,
                client_certificate = keystore.is_some(),
                "Integration user registered"
            );
        }

        Ok(())
    }

    /// Registered user ids, sorted.
    pub fn users(&self) -> Vec<String> {
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        let mut users: Vec<String> = contexts.keys().cloned().collect();
        users.sort();
        users
    }

    /// Obtain session and key-manager credentials for `user_id`.
    ///
    /// No-op when the user is already authenticated. The credential pair is
    /// installed only when both services answer.
    pub async fn authenticate(&self, user_id: &str) -> Result<(), AuthError> {
        let context = self.context_for_user(user_id)?;
        self.authenticate_context(&context).await
    }

    pub fn is_authenticated(&self, user_id: &str) -> Result<bool, AuthError> {
        Ok(self.context_for_user(user_id)?.is_authenticated())
    }

    /// Mark the user's credential as unusable. The stored tokens still resolve.
    pub fn invalidate(&self, user_id: &str) -> Result<(), AuthError> {
        self.context_for_user(user_id)?.invalidate();
        info!(user_id = %user_id, "Session invalidated");
        Ok(())
    }

    /// Current credential of `user_id`; [`AuthenticationToken::VOID`] until
    /// the first successful authentication.
    pub fn get_token(&self, user_id: &str) -> Result<AuthenticationToken, AuthError> {
        Ok(self.context_for_user(user_id)?.current())
    }

    pub fn get_session_token(&self, user_id: &str) -> Result<String, AuthError> {
        Ok(self.get_token(user_id)?.session_token().to_string())
    }

    pub fn context_for_user(
        &self,
        user_id: &str,
    ) -> Result<Arc<AuthenticationContext>, AuthError> {
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        contexts
            .get(user_id)
            .cloned()
            .ok_or_else(|| AuthError::unregistered_user(user_id))
    }

    /// Resolve the context holding `session_token` as its current credential,
    /// or failing that as its previous one.
    pub fn context_for_session_token(
        &self,
        session_token: &str,
    ) -> Result<Arc<AuthenticationContext>, AuthError> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let user_id = sessions
            .lookup(session_token)
            .ok_or(AuthError::UnregisteredSessionToken)?;
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        contexts
            .get(user_id)
            .cloned()
            .ok_or(AuthError::UnregisteredSessionToken)
    }

    /// Whether the user's current credential is old enough for a 401 to mean
    /// an expired session.
    pub fn should_invalidate_session(&self, user_id: &str) -> Result<bool, AuthError> {
        let context = self.context_for_user(user_id)?;
        Ok(self.is_expired(&context.current()))
    }

    /// Recover from a failed call made on behalf of `user_id`.
    ///
    /// Any status other than 401 hands `cause` back as
    /// [`ReAuthError::Rejected`]. On a 401 the user is re-authenticated when
    /// the credential has reached the session age ceiling; otherwise the call
    /// returns without contacting the authentication services.
    pub async fn re_auth_or_throw<E>(
        &self,
        user_id: &str,
        status: StatusCode,
        cause: E,
    ) -> Result<(), ReAuthError<E>> {
        if !Self::session_unauthorized(status) {
            return Err(ReAuthError::Rejected(cause));
        }

        let _guard = self.re_auth_lock.lock().await;
        let context = self.context_for_user(user_id)?;
        self.re_auth_locked(&context).await?;
        Ok(())
    }

    /// Session-keyed variant of [`re_auth_or_throw`](Self::re_auth_or_throw).
    ///
    /// Returns the credential the caller should retry with. The session token
    /// must belong to a registered user, whatever the status.
    pub async fn re_auth_session_or_throw<E>(
        &self,
        session_token: &str,
        status: StatusCode,
        cause: E,
    ) -> Result<AuthenticationToken, ReAuthError<E>> {
        let context = self.context_for_session_token(session_token)?;
        if !Self::session_unauthorized(status) {
            return Err(ReAuthError::Rejected(cause));
        }

        let _guard = self.re_auth_lock.lock().await;
        self.re_auth_locked(&context).await?;
        Ok(context.current())
    }

    pub fn http_client_for_user(&self, user_id: &str) -> Result<Client, AuthError> {
        Ok(self.context_for_user(user_id)?.transport().clone())
    }

    pub fn http_client_for_session_token(&self, session_token: &str) -> Result<Client, AuthError> {
        Ok(self.context_for_session_token(session_token)?.transport().clone())
    }

    pub fn session_unauthorized(status: StatusCode) -> bool {
        status == StatusCode::UNAUTHORIZED
    }

    pub fn session_no_longer_entitled(status: StatusCode) -> bool {
        status == StatusCode::FORBIDDEN
    }

    // Caller holds `re_auth_lock`.
    async fn re_auth_locked(&self, context: &AuthenticationContext) -> Result<(), AuthError> {
        let current = context.current();
        if !self.is_expired(&current) {
            debug!(
                user_id = %context.user_id(),
                age_ms = current.age_millis(self.clock.now_millis()),
                "Session still fresh, skipping re-authentication"
            );
            return Ok(());
        }

        info!(user_id = %context.user_id(), "Session expired, re-authenticating");
        context.invalidate();
        self.authenticate_context(context).await
    }

    async fn authenticate_context(&self, context: &AuthenticationContext) -> Result<(), AuthError> {
        let user_id = context.user_id();
        if context.is_authenticated() {
            debug!(user_id = %user_id, "Already authenticated");
            return Ok(());
        }

        let token = match self.request_credential(context).await {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Authentication failed"
                );
                return Err(e);
            }
        };

        self.install(context, token);
        info!(user_id = %user_id, "Integration user authenticated");
        Ok(())
    }

    async fn request_credential(
        &self,
        context: &AuthenticationContext,
    ) -> Result<AuthenticationToken, AuthError> {
        let user_id = context.user_id();
        let transport = context.transport();

        let session = self
            .session_auth
            .authenticate(user_id, transport)
            .await
            .map_err(|e| e.classify(user_id))?;
        let key_manager = self
            .key_manager_auth
            .authenticate(user_id, transport)
            .await
            .map_err(|e| e.classify(user_id))?;

        Ok(AuthenticationToken::new(
            session.token,
            key_manager.token,
            self.clock.now_millis(),
        ))
    }

    // The credential and its index entries change under the sessions lock, so
    // a lookup never sees one without the other.
    fn install(&self, context: &AuthenticationContext, token: AuthenticationToken) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        let registered = contexts
            .get(context.user_id())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), context));
        let Some(rotation) = context.set_credential(token) else {
            return;
        };
        if registered {
            sessions.rotate(context.user_id(), &rotation);
        }
    }

    fn is_expired(&self, token: &AuthenticationToken) -> bool {
        let ceiling = i64::try_from(self.max_session_age.as_millis()).unwrap_or(i64::MAX);
        token.age_millis(self.clock.now_millis()) >= ceiling
    }
}

impl fmt::Debug for AuthenticationProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationProxy")
            .field("users", &self.users())
            .field("session_service", &self.session_auth.service())
            .field("key_manager_service", &self.key_manager_auth.service())
            .field("max_session_age", &self.max_session_age)
            .finish_non_exhaustive()
    }
}
