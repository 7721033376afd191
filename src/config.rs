// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names, default values, and the
//! JSON configuration document describing remote services, HTTP client
//! limits, and the integration users to register at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `INTEGRATION_CONFIG` | Path to the JSON configuration file | Required |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |
//!
//! ## Configuration File
//!
//! ```json
//! {
//!   "services": {
//!     "session_auth": { "url": "https://pod.example.com:8444/sessionauth" },
//!     "key_auth": { "url": "https://km.example.com:8444/keyauth" },
//!     "pod": {
//!       "url": "https://pod.example.com/pod",
//!       "proxy": { "uri": "http://proxy.internal:3128", "user": "svc", "password": "secret" }
//!     }
//!   },
//!   "http_client": { "connect_timeout_ms": 2000, "read_timeout_ms": 5000 },
//!   "integrations": [
//!     {
//!       "user_id": "jirawebhook",
//!       "keystore": { "file": "/certs/jirawebhook.pem", "passphrase": "changeit" }
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Environment variable name for the configuration file path.
pub const INTEGRATION_CONFIG_ENV: &str = "INTEGRATION_CONFIG";

/// Environment variable selecting the log output format (`json` or `pretty`).
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_CONNECTIONS: usize = 20;
const DEFAULT_MAX_CONNECTIONS_PER_ROUTE: usize = 10;

/// Remote services an integration user talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceName {
    /// Platform API (messages, streams, users)
    Pod,
    /// Message agent
    Agent,
    /// Key manager (encryption keys)
    KeyManager,
    /// Session authentication endpoint
    SessionAuth,
    /// Key-manager authentication endpoint
    KeyAuth,
}

impl ServiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceName::Pod => "pod",
            ServiceName::Agent => "agent",
            ServiceName::KeyManager => "key_manager",
            ServiceName::SessionAuth => "session_auth",
            ServiceName::KeyAuth => "key_auth",
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound proxy used to reach one service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConnectionInfo {
    pub uri: Url,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Base URL and optional proxy for a remote service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionInfo {
    pub url: Url,
    #[serde(default)]
    pub proxy: Option<ProxyConnectionInfo>,
}

/// Connection pool limits and timeouts applied to every user transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_connections: usize,
    pub max_connections_per_route: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_route: DEFAULT_MAX_CONNECTIONS_PER_ROUTE,
        }
    }
}

impl HttpClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Location of a user's PEM client identity.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct KeystoreConfig {
    /// PEM bundle holding the certificate chain and private key
    pub file: PathBuf,
    /// Decrypts an `ENCRYPTED PRIVATE KEY` block in `file`
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Extra CA certificates to trust (PEM)
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

impl fmt::Debug for KeystoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreConfig")
            .field("file", &self.file)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("ca_file", &self.ca_file)
            .finish()
    }
}

/// An integration user to register at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IntegrationUser {
    pub user_id: String,
    /// Absent means the default trust store and no client certificate.
    #[serde(default)]
    pub keystore: Option<KeystoreConfig>,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntegrationProperties {
    #[serde(default)]
    pub services: HashMap<ServiceName, ConnectionInfo>,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default)]
    pub integrations: Vec<IntegrationUser>,
}

impl IntegrationProperties {
    /// Load the document named by `INTEGRATION_CONFIG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(INTEGRATION_CONFIG_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingEnv(INTEGRATION_CONFIG_ENV.to_string()))?;
        Self::from_file(path)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Connection info for a service that must be configured.
    pub fn service(&self, name: ServiceName) -> Result<&ConnectionInfo, ConfigError> {
        self.services
            .get(&name)
            .ok_or(ConfigError::MissingService(name))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("failed to read configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no connection info configured for service {0}")]
    MissingService(ServiceName),

    #[error("invalid URL for service {service}: {source}")]
    InvalidUrl {
        service: ServiceName,
        #[source]
        source: url::ParseError,
    },
}
