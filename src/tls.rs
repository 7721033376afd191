// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Transport factory for per-user TLS clients.
//!
//! Every integration user owns one `reqwest::Client` configured with that
//! user's client certificate (or the default trust store when none is
//! configured), the shared timeout/pool limits, and the per-service outbound
//! proxies. The client is built once at registration and never rebuilt, so
//! its connection pool lives as long as the user's authentication context.
//!
//! ## Keystore Format
//!
//! Client identities are PEM bundles: one or more `CERTIFICATE` blocks
//! followed by exactly one `PRIVATE KEY`, `RSA PRIVATE KEY` or
//! `EC PRIVATE KEY` block. An `ENCRYPTED PRIVATE KEY` (PKCS#8 PBES2) block is
//! accepted when the keystore carries a passphrase; it is decrypted once when
//! the keystore is loaded and handed to rustls as a plain `PRIVATE KEY`.
//! Legacy OpenSSL `Proc-Type: 4,ENCRYPTED` keys are never accepted.

use std::fs;
use std::path::Path;

use pem::Pem;
use pkcs8::EncryptedPrivateKeyInfo;
use reqwest::{Certificate, Client, Identity, Proxy};
use url::Url;

use crate::config::{
    HttpClientConfig, IntegrationProperties, KeystoreConfig, ProxyConnectionInfo, ServiceName,
};

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const ENCRYPTED_KEY_TAG: &str = "ENCRYPTED PRIVATE KEY";
const PKCS8_KEY_TAG: &str = "PRIVATE KEY";
const PRIVATE_KEY_TAGS: [&str; 3] = ["PRIVATE KEY", "RSA PRIVATE KEY", "EC PRIVATE KEY"];

/// Client certificate material for one integration user.
#[derive(Clone)]
pub struct Keystore {
    identity_pem: Vec<u8>,
    ca_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore")
            .field("identity_pem", &"<redacted>")
            .field("has_ca", &self.ca_pem.is_some())
            .finish()
    }
}

impl Keystore {
    /// Validate and wrap a PEM identity bundle.
    pub fn from_pem(identity_pem: impl Into<Vec<u8>>) -> Result<Self, TlsError> {
        let identity_pem = identity_pem.into();
        validate_identity(&identity_pem)?;
        Ok(Self {
            identity_pem,
            ca_pem: None,
        })
    }

    /// Decrypt the `ENCRYPTED PRIVATE KEY` block of `identity_pem` with
    /// `passphrase`, then validate the result like [`Keystore::from_pem`].
    /// A bundle without an encrypted key is taken as is.
    pub fn from_encrypted_pem(
        identity_pem: impl AsRef<[u8]>,
        passphrase: &str,
    ) -> Result<Self, TlsError> {
        Self::from_pem(decrypt_identity(identity_pem.as_ref(), passphrase)?)
    }

    /// Trust additional CA certificates when talking to the services.
    pub fn with_ca_pem(mut self, ca_pem: impl Into<Vec<u8>>) -> Result<Self, TlsError> {
        let ca_pem = ca_pem.into();
        let blocks = pem::parse_many(&ca_pem)
            .map_err(|e| TlsError::InvalidKeystore(format!("CA bundle: {e}")))?;
        if !blocks.iter().any(|b| b.tag() == CERTIFICATE_TAG) {
            return Err(TlsError::InvalidKeystore(
                "CA bundle has no CERTIFICATE block".to_string(),
            ));
        }
        self.ca_pem = Some(ca_pem);
        Ok(self)
    }

    /// Read the files named by a keystore configuration entry.
    pub fn from_config(config: &KeystoreConfig) -> Result<Self, TlsError> {
        let identity_pem = read_file(&config.file)?;
        let keystore = match &config.passphrase {
            Some(passphrase) => Self::from_encrypted_pem(identity_pem, passphrase)?,
            None => Self::from_pem(identity_pem)?,
        };
        match &config.ca_file {
            Some(ca_file) => keystore.with_ca_pem(read_file(ca_file)?),
            None => Ok(keystore),
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn is_legacy_encrypted(block: &Pem) -> bool {
    block
        .headers()
        .get("Proc-Type")
        .is_some_and(|v| v.contains("ENCRYPTED"))
}

/// Re-encode `identity_pem` with every PKCS#8 encrypted key replaced by its
/// decrypted `PRIVATE KEY` block.
fn decrypt_identity(identity_pem: &[u8], passphrase: &str) -> Result<Vec<u8>, TlsError> {
    let blocks =
        pem::parse_many(identity_pem).map_err(|e| TlsError::InvalidKeystore(e.to_string()))?;
    if !blocks.iter().any(|b| b.tag() == ENCRYPTED_KEY_TAG) {
        return Ok(identity_pem.to_vec());
    }
    if blocks.iter().any(is_legacy_encrypted) {
        return Err(TlsError::EncryptedKey);
    }

    let mut decrypted = Vec::with_capacity(blocks.len());
    for block in blocks {
        if block.tag() != ENCRYPTED_KEY_TAG {
            decrypted.push(block);
            continue;
        }
        let info = EncryptedPrivateKeyInfo::try_from(block.contents())
            .map_err(|e| TlsError::Decrypt(e.into()))?;
        let document = info.decrypt(passphrase).map_err(TlsError::Decrypt)?;
        decrypted.push(Pem::new(PKCS8_KEY_TAG, document.as_bytes().to_vec()));
    }
    Ok(pem::encode_many(&decrypted).into_bytes())
}

fn validate_identity(identity_pem: &[u8]) -> Result<(), TlsError> {
    let blocks =
        pem::parse_many(identity_pem).map_err(|e| TlsError::InvalidKeystore(e.to_string()))?;

    if blocks
        .iter()
        .any(|b| b.tag() == ENCRYPTED_KEY_TAG || is_legacy_encrypted(b))
    {
        return Err(TlsError::EncryptedKey);
    }

    if !blocks.iter().any(|b| b.tag() == CERTIFICATE_TAG) {
        return Err(TlsError::InvalidKeystore(
            "no CERTIFICATE block found".to_string(),
        ));
    }

    let keys = blocks
        .iter()
        .filter(|b| PRIVATE_KEY_TAGS.contains(&b.tag()))
        .count();
    if keys != 1 {
        return Err(TlsError::InvalidKeystore(format!(
            "expected exactly one private key, found {keys}"
        )));
    }

    Ok(())
}

/// Proxy routing for requests addressed to one service's origin.
#[derive(Debug, Clone)]
struct ServiceProxy {
    service: ServiceName,
    host: String,
    port: Option<u16>,
    info: ProxyConnectionInfo,
}

impl ServiceProxy {
    fn new(service: ServiceName, service_url: &Url, info: ProxyConnectionInfo) -> Option<Self> {
        Some(Self {
            service,
            host: service_url.host_str()?.to_ascii_lowercase(),
            port: service_url.port_or_known_default(),
            info,
        })
    }

    fn matches(&self, url: &Url) -> bool {
        url.host_str()
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.host))
            && url.port_or_known_default() == self.port
    }

    fn to_reqwest(&self) -> Proxy {
        let target = self.clone();
        let proxy_uri = self.info.uri.clone();
        let proxy = Proxy::custom(move |url| {
            if target.matches(url) {
                Some(proxy_uri.clone())
            } else {
                None
            }
        });
        match (&self.info.user, &self.info.password) {
            (Some(user), password) => {
                proxy.basic_auth(user, password.as_deref().unwrap_or_default())
            }
            (None, _) => proxy,
        }
    }
}

/// Builds the HTTP client owned by each authentication context.
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    config: HttpClientConfig,
    proxies: Vec<ServiceProxy>,
}

impl TransportFactory {
    pub fn new(config: HttpClientConfig) -> Self {
        Self {
            config,
            proxies: Vec::new(),
        }
    }

    /// Factory using the configured client limits and every service proxy.
    pub fn from_properties(properties: &IntegrationProperties) -> Self {
        let proxies = properties
            .services
            .iter()
            .filter_map(|(service, info)| {
                let proxy = info.proxy.clone()?;
                ServiceProxy::new(*service, &info.url, proxy)
            })
            .collect();

        Self {
            config: properties.http_client.clone(),
            proxies,
        }
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Services whose traffic is routed through an outbound proxy.
    pub fn proxied_services(&self) -> Vec<ServiceName> {
        self.proxies.iter().map(|p| p.service).collect()
    }

    /// Build a client bound to `keystore`, or to the default trust store.
    pub fn build(&self, keystore: Option<&Keystore>) -> Result<Client, TlsError> {
        // Only configured service proxies apply; environment proxies are ignored.
        let mut builder = Client::builder()
            .use_rustls_tls()
            .no_proxy()
            .connect_timeout(self.config.connect_timeout())
            .read_timeout(self.config.read_timeout())
            .pool_max_idle_per_host(self.pool_idle_limit());

        if let Some(keystore) = keystore {
            let identity =
                Identity::from_pem(&keystore.identity_pem).map_err(TlsError::Identity)?;
            builder = builder.identity(identity);

            if let Some(ca_pem) = &keystore.ca_pem {
                for cert in Certificate::from_pem_bundle(ca_pem).map_err(TlsError::Certificate)? {
                    builder = builder.add_root_certificate(cert);
                }
            }
        }

        for proxy in &self.proxies {
            builder = builder.proxy(proxy.to_reqwest());
        }

        builder.build().map_err(TlsError::Build)
    }

    // reqwest has no global connection ceiling; the idle pool per host is the
    // only limit it exposes.
    fn pool_idle_limit(&self) -> usize {
        self.config
            .max_connections_per_route
            .min(self.config.max_connections)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid keystore: {0}")]
    InvalidKeystore(String),

    #[error("private key is encrypted; configure a keystore passphrase or use a PKCS#8 encrypted key")]
    EncryptedKey,

    #[error("failed to decrypt private key: {0}")]
    Decrypt(#[source] pkcs8::Error),

    #[error("invalid client identity: {0}")]
    Identity(#[source] reqwest::Error),

    #[error("invalid CA certificate: {0}")]
    Certificate(#[source] reqwest::Error),

    #[error("failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
}
