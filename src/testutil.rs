// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared test doubles.

use std::collections::VecDeque;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use reqwest::Client;
use url::Url;

use crate::auth::proxy::Clock;
use crate::auth::{AuthenticatorError, RemoteAuthenticator, Token};
use crate::config::ServiceName;

/// Clock that only moves when told to.
#[derive(Debug)]
pub(crate) struct ManualClock(AtomicI64);

impl ManualClock {
    pub(crate) fn new(start_millis: i64) -> Self {
        Self(AtomicI64::new(start_millis))
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Authenticator answering from a script, then with `{prefix}{call number}`.
pub(crate) struct ScriptedAuthenticator {
    service: ServiceName,
    prefix: &'static str,
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<Token, AuthenticatorError>>>,
    delay: Option<Duration>,
}

impl ScriptedAuthenticator {
    pub(crate) fn new(service: ServiceName, prefix: &'static str) -> Self {
        Self {
            service,
            prefix,
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            delay: None,
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn push_err(&self, err: AuthenticatorError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteAuthenticator for ScriptedAuthenticator {
    fn service(&self) -> ServiceName {
        self.service
    }

    async fn authenticate(
        &self,
        _user_id: &str,
        _transport: &Client,
    ) -> Result<Token, AuthenticatorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(Token {
                name: self.service.to_string(),
                token: format!("{}{call}", self.prefix),
            })
        })
    }
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub(crate) async fn spawn_server(router: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

/// Client that never goes through an environment proxy.
pub(crate) fn direct_client() -> Client {
    Client::builder().no_proxy().build().unwrap()
}

/// URL of a local port nothing listens on.
pub(crate) fn closed_port_url() -> Url {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{addr}/")).unwrap()
}
