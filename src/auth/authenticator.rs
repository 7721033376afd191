// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Remote authentication endpoints.
//!
//! The session service and the key-manager service each expose
//! `POST {base}/v1/authenticate`. The caller is identified by the client
//! certificate of the transport the request is sent through, so every call
//! uses the integration user's own client. A success body looks like
//! `{"name": "sessionToken", "token": "..."}`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::error::AuthenticatorError;
use crate::config::{ConfigError, IntegrationProperties, ServiceName};
use crate::error::ApiError;

const AUTHENTICATE_PATH: &str = "/v1/authenticate";

/// Token issued by an authentication endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Token {
    /// Display name of the token (`sessionToken`, `keyManagerToken`)
    #[serde(default)]
    pub name: String,
    pub token: String,
}

/// Obtains a token for an integration user from one remote service.
#[async_trait]
pub trait RemoteAuthenticator: Send + Sync {
    fn service(&self) -> ServiceName;

    async fn authenticate(
        &self,
        user_id: &str,
        transport: &Client,
    ) -> Result<Token, AuthenticatorError>;
}

/// [`RemoteAuthenticator`] speaking to `POST {base}/v1/authenticate`.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    service: ServiceName,
    endpoint: Url,
}

impl HttpAuthenticator {
    pub fn new(service: ServiceName, base_url: &Url) -> Result<Self, url::ParseError> {
        let endpoint = Url::parse(&format!(
            "{}{}",
            base_url.as_str().trim_end_matches('/'),
            AUTHENTICATE_PATH
        ))?;
        Ok(Self { service, endpoint })
    }

    /// Authenticator for a service declared in the configuration.
    pub fn from_properties(
        properties: &IntegrationProperties,
        service: ServiceName,
    ) -> Result<Self, ConfigError> {
        let info = properties.service(service)?;
        Self::new(service, &info.url).map_err(|source| ConfigError::InvalidUrl { service, source })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteAuthenticator for HttpAuthenticator {
    fn service(&self) -> ServiceName {
        self.service
    }

    async fn authenticate(
        &self,
        user_id: &str,
        transport: &Client,
    ) -> Result<Token, AuthenticatorError> {
        debug!(user_id = %user_id, service = %self.service, "Requesting token");

        let response = transport
            .post(self.endpoint.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    AuthenticatorError::Other(Box::new(e))
                } else {
                    AuthenticatorError::Connectivity {
                        service: self.service,
                        source: Box::new(e),
                    }
                }
            })?;

        if !response.status().is_success() {
            return Err(ApiError::from_response(response).await.into());
        }

        response
            .json::<Token>()
            .await
            .map_err(|e| AuthenticatorError::Other(Box::new(e)))
    }
}
