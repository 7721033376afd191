// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Application object graph.
//!
//! Built once at startup in a fixed order: transport factory, remote
//! authenticators, authentication proxy, user registration, then one call
//! decorator per configured platform service.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::auth::{AuthError, AuthenticationProxy, HttpAuthenticator};
use crate::client::ApiClientDecorator;
use crate::config::{ConfigError, IntegrationProperties, ServiceName};
use crate::tls::{Keystore, TlsError, TransportFactory};

/// Platform services that get a call decorator when configured.
const DECORATED_SERVICES: [ServiceName; 3] =
    [ServiceName::Pod, ServiceName::Agent, ServiceName::KeyManager];

#[derive(Clone, Debug)]
pub struct AppState {
    pub proxy: Arc<AuthenticationProxy>,
    pub clients: HashMap<ServiceName, ApiClientDecorator>,
}

impl AppState {
    pub fn new(proxy: Arc<AuthenticationProxy>) -> Self {
        Self {
            proxy,
            clients: HashMap::new(),
        }
    }

    /// Build the graph described by `properties` and register every
    /// configured integration user.
    pub fn from_properties(properties: &IntegrationProperties) -> Result<Self, StartupError> {
        let transport_factory = TransportFactory::from_properties(properties);
        let proxied = transport_factory.proxied_services();
        if !proxied.is_empty() {
            info!(services = ?proxied, "Outbound proxies configured");
        }

        let session_auth =
            HttpAuthenticator::from_properties(properties, ServiceName::SessionAuth)?;
        let key_manager_auth =
            HttpAuthenticator::from_properties(properties, ServiceName::KeyAuth)?;
        let proxy = Arc::new(AuthenticationProxy::new(
            transport_factory,
            Arc::new(session_auth),
            Arc::new(key_manager_auth),
        ));

        for user in &properties.integrations {
            let keystore = user
                .keystore
                .as_ref()
                .map(Keystore::from_config)
                .transpose()
                .map_err(|source| StartupError::Keystore {
                    user_id: user.user_id.clone(),
                    source,
                })?;
            proxy.register_user(&user.user_id, keystore.as_ref())?;
        }

        let mut state = Self::new(proxy);
        for service in DECORATED_SERVICES {
            if properties.services.contains_key(&service) {
                let client =
                    ApiClientDecorator::for_service(state.proxy.clone(), properties, service)?;
                state.clients.insert(service, client);
            }
        }

        Ok(state)
    }

    pub fn client(&self, service: ServiceName) -> Option<&ApiClientDecorator> {
        self.clients.get(&service)
    }

    /// Authenticate every registered user, one after another.
    pub async fn authenticate_all(&self) -> Vec<(String, Result<(), AuthError>)> {
        let mut outcomes = Vec::new();
        for user_id in self.proxy.users() {
            let outcome = self.proxy.authenticate(&user_id).await;
            outcomes.push((user_id, outcome));
        }
        outcomes
    }
}

/// Failure while building the application graph.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid keystore for user {user_id}: {source}")]
    Keystore {
        user_id: String,
        #[source]
        source: TlsError,
    },

    #[error(transparent)]
    Registration(#[from] AuthError),
}
