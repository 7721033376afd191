// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Call Decorator
//!
//! Wraps one outbound call to a platform service on behalf of an integration
//! user. Every request carries the user's `sessionToken` header and an
//! `X-Trace-Id` header, and goes out over the user's own transport.
//!
//! A failed response is handed to the authentication proxy once. When the
//! proxy re-authenticates (expired session) the call is retried exactly once
//! with the refreshed session token; a second failure is returned as is.
//! Connectivity failures never enter the re-authentication path.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::auth::AuthenticationProxy;
use crate::config::{ConfigError, IntegrationProperties, ServiceName};
use crate::error::{ApiError, ClientError};

/// Header carrying the session credential.
pub const SESSION_TOKEN_HEADER: &str = "sessionToken";

/// Header correlating one logical call across retries and services.
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// A single call to a platform service, relative to the service base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<serde_json::Value>,
    trace_id: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            trace_id: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a JSON body.
    pub fn with_json<T: Serialize>(mut self, body: &T) -> Result<Self, ClientError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ClientError::InvalidRequest(format!("unserializable body: {e}")))?;
        self.body = Some(body);
        Ok(self)
    }

    /// Use a caller-supplied trace id instead of a fresh one.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Authenticated, self-healing client for one platform service.
#[derive(Debug, Clone)]
pub struct ApiClientDecorator {
    proxy: Arc<AuthenticationProxy>,
    service: ServiceName,
    base_url: Url,
    default_headers: Vec<(String, String)>,
}

impl ApiClientDecorator {
    pub fn new(proxy: Arc<AuthenticationProxy>, service: ServiceName, base_url: Url) -> Self {
        Self {
            proxy,
            service,
            base_url,
            default_headers: Vec::new(),
        }
    }

    /// Decorator for a service declared in the configuration.
    pub fn for_service(
        proxy: Arc<AuthenticationProxy>,
        properties: &IntegrationProperties,
        service: ServiceName,
    ) -> Result<Self, ConfigError> {
        let info = properties.service(service)?;
        Ok(Self::new(proxy, service, info.url.clone()))
    }

    /// Header sent with every request of this client.
    pub fn with_default_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn service(&self) -> ServiceName {
        self.service
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Call on behalf of whoever holds `session_token`.
    ///
    /// The transport is resolved from the session token. A failed response
    /// goes through [`AuthenticationProxy::re_auth_session_or_throw`] and the
    /// call is retried once with the credential it returns.
    pub async fn invoke_with_session<T: DeserializeOwned>(
        &self,
        session_token: &str,
        request: &ApiRequest,
    ) -> Result<T, ClientError> {
        let trace_id = trace_id_for(request);
        let transport = self.proxy.http_client_for_session_token(session_token)?;

        match self.send(&transport, request, session_token, &trace_id).await {
            Err(ClientError::Api(cause)) => {
                let status = cause.status;
                let token = self
                    .proxy
                    .re_auth_session_or_throw(session_token, status, cause)
                    .await?;
                self.log_retry(status, &trace_id);
                self.send(&transport, request, token.session_token(), &trace_id)
                    .await
            }
            outcome => outcome,
        }
    }

    /// Call as `user_id`.
    ///
    /// A failed response goes through [`AuthenticationProxy::re_auth_or_throw`]
    /// and the call is retried once with the user's session token read again.
    pub async fn invoke_for_user<T: DeserializeOwned>(
        &self,
        user_id: &str,
        request: &ApiRequest,
    ) -> Result<T, ClientError> {
        let trace_id = trace_id_for(request);
        let transport = self.proxy.http_client_for_user(user_id)?;
        let session_token = self.proxy.get_session_token(user_id)?;

        match self.send(&transport, request, &session_token, &trace_id).await {
            Err(ClientError::Api(cause)) => {
                let status = cause.status;
                self.proxy.re_auth_or_throw(user_id, status, cause).await?;
                self.log_retry(status, &trace_id);
                let session_token = self.proxy.get_session_token(user_id)?;
                self.send(&transport, request, &session_token, &trace_id)
                    .await
            }
            outcome => outcome,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        transport: &Client,
        request: &ApiRequest,
        session_token: &str,
        trace_id: &str,
    ) -> Result<T, ClientError> {
        let url = self.url_for(&request.path)?;
        debug!(
            service = %self.service,
            method = %request.method,
            path = %request.path,
            trace_id = %trace_id,
            "Outbound call"
        );

        let headers = self.headers_for(request, session_token, trace_id)?;
        let mut builder = transport
            .request(request.method.clone(), url)
            .headers(headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_response(response).await.into());
        }

        let bytes = response.bytes().await.map_err(|e| self.transport_error(e))?;
        let decoded = if status == StatusCode::NO_CONTENT || bytes.is_empty() {
            serde_json::from_value(serde_json::Value::Null)
        } else {
            serde_json::from_slice(&bytes)
        };
        decoded.map_err(|e| ClientError::InvalidResponse {
            service: self.service,
            message: e.to_string(),
        })
    }

    /// Default headers, then request headers, then the trace id and session
    /// token. A later source replaces an earlier header of the same name.
    fn headers_for(
        &self,
        request: &ApiRequest,
        session_token: &str,
        trace_id: &str,
    ) -> Result<HeaderMap, ClientError> {
        let fixed = [(TRACE_ID_HEADER, trace_id), (SESSION_TOKEN_HEADER, session_token)];
        let pairs = self
            .default_headers
            .iter()
            .chain(&request.headers)
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .chain(fixed);

        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::InvalidRequest(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::InvalidRequest(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    fn url_for(&self, path: &str) -> Result<Url, ClientError> {
        let raw = format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        Url::parse(&raw).map_err(|e| ClientError::InvalidRequest(format!("{raw}: {e}")))
    }

    fn transport_error(&self, err: reqwest::Error) -> ClientError {
        if err.is_builder() {
            ClientError::InvalidRequest(err.to_string())
        } else {
            ClientError::Connectivity {
                service: self.service,
                source: err,
            }
        }
    }

    fn log_retry(&self, status: StatusCode, trace_id: &str) {
        info!(
            service = %self.service,
            status = %status,
            trace_id = %trace_id,
            "Retrying call with refreshed session"
        );
    }
}

fn trace_id_for(request: &ApiRequest) -> String {
    request
        .trace_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::extract::Query;
    use axum::http::HeaderMap;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{any, get};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use crate::auth::{AuthError, AuthenticatorError, DEFAULT_MAX_SESSION_AGE};
    use crate::testutil::{closed_port_url, spawn_server, ManualClock, ScriptedAuthenticator};
    use crate::tls::TransportFactory;

    struct Fixture {
        proxy: Arc<AuthenticationProxy>,
        session: Arc<ScriptedAuthenticator>,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let session = Arc::new(ScriptedAuthenticator::new(ServiceName::SessionAuth, "S"));
        let key_manager = Arc::new(ScriptedAuthenticator::new(ServiceName::KeyAuth, "K"));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let proxy = AuthenticationProxy::new(
            TransportFactory::default(),
            session.clone(),
            key_manager,
        )
        .with_clock(clock.clone());
        let proxy = Arc::new(proxy);
        proxy.register_user("jira", None).unwrap();
        proxy.authenticate("jira").await.unwrap();

        Fixture {
            proxy,
            session,
            clock,
        }
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Route that accepts only `accepted` as session token and counts hits.
    fn guarded(accepted: &'static str, hits: Arc<AtomicUsize>) -> Router {
        Router::new().route(
            "/pod/v1/info",
            get(move |headers: HeaderMap| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let response: Response = match header(&headers, "sessiontoken").as_deref() {
                        Some(token) if token == accepted => {
                            Json(json!({ "session": token })).into_response()
                        }
                        _ => (axum::http::StatusCode::UNAUTHORIZED, "expired").into_response(),
                    };
                    response
                }
            }),
        )
    }

    async fn decorator(f: &Fixture, router: Router) -> ApiClientDecorator {
        let base = spawn_server(router).await;
        ApiClientDecorator::new(f.proxy.clone(), ServiceName::Pod, base.join("pod").unwrap())
    }

    #[tokio::test]
    async fn attaches_credential_trace_and_query() {
        let f = fixture().await;
        let router = Router::new().route(
            "/pod/v1/echo",
            any(
                |headers: HeaderMap, Query(query): Query<HashMap<String, String>>, body: String| async move {
                    Json(json!({
                        "session": header(&headers, "sessiontoken"),
                        "trace": header(&headers, "x-trace-id"),
                        "client": header(&headers, "x-client"),
                        "custom": header(&headers, "x-custom"),
                        "limit": query.get("limit"),
                        "body": body,
                    }))
                },
            ),
        );
        let client = decorator(&f, router)
            .await
            .with_default_header("X-Client", "integration");

        let request = ApiRequest::post("/v1/echo")
            .with_query("limit", 10)
            .with_header("X-Custom", "yes")
            .with_json(&json!({ "text": "hello" }))
            .unwrap()
            .with_trace_id("trace-1");
        let echoed: Value = client.invoke_for_user("jira", &request).await.unwrap();

        assert_eq!(echoed["session"], "S1");
        assert_eq!(echoed["trace"], "trace-1");
        assert_eq!(echoed["client"], "integration");
        assert_eq!(echoed["custom"], "yes");
        assert_eq!(echoed["limit"], "10");
        assert_eq!(echoed["body"], r#"{"text":"hello"}"#);
    }

    #[tokio::test]
    async fn generates_a_trace_id_when_none_is_given() {
        let f = fixture().await;
        let router = Router::new().route(
            "/pod/v1/trace",
            get(|headers: HeaderMap| async move { Json(json!(header(&headers, "x-trace-id"))) }),
        );
        let client = decorator(&f, router).await;

        let trace: Option<String> = client
            .invoke_with_session("S1", &ApiRequest::get("v1/trace"))
            .await
            .unwrap();

        let trace = trace.unwrap();
        assert!(Uuid::parse_str(&trace).is_ok());
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_and_retried_once() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let client = decorator(&f, guarded("S2", hits.clone())).await;
        f.clock.advance(DEFAULT_MAX_SESSION_AGE);

        let body: Value = client
            .invoke_with_session("S1", &ApiRequest::get("v1/info"))
            .await
            .unwrap();

        assert_eq!(body["session"], "S2");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(f.session.calls(), 2);
    }

    #[tokio::test]
    async fn user_keyed_call_rereads_the_session_token() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let client = decorator(&f, guarded("S2", hits.clone())).await;
        f.clock.advance(Duration::from_secs(600));

        let body: Value = client
            .invoke_for_user("jira", &ApiRequest::get("v1/info"))
            .await
            .unwrap();

        assert_eq!(body["session"], "S2");
        assert_eq!(f.proxy.get_session_token("jira").unwrap(), "S2");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_401_is_surfaced_without_another_retry() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let client = decorator(&f, guarded("never", hits.clone())).await;
        f.clock.advance(DEFAULT_MAX_SESSION_AGE);

        let err = client
            .invoke_with_session::<Value>("S1", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(reqwest::StatusCode::UNAUTHORIZED));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(f.session.calls(), 2);
    }

    #[tokio::test]
    async fn user_keyed_retry_is_bounded_to_one() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let client = decorator(&f, guarded("never", hits.clone())).await;
        f.clock.advance(DEFAULT_MAX_SESSION_AGE);

        let err = client
            .invoke_for_user::<Value>("jira", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(reqwest::StatusCode::UNAUTHORIZED));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(f.session.calls(), 2);
        assert_eq!(f.proxy.get_session_token("jira").unwrap(), "S2");
    }

    #[tokio::test]
    async fn fresh_credential_401_retries_once_without_reauthenticating() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let client = decorator(&f, guarded("never", hits.clone())).await;

        let err = client
            .invoke_with_session::<Value>("S1", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Api(ref api) if api.is_unauthorized()));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let err = client
            .invoke_for_user::<Value>("jira", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Api(ref api) if api.is_unauthorized()));
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        assert_eq!(f.session.calls(), 1);
        assert_eq!(f.proxy.get_session_token("jira").unwrap(), "S1");
    }

    #[tokio::test]
    async fn request_headers_replace_defaults_and_never_the_credential() {
        let f = fixture().await;
        let router = Router::new().route(
            "/pod/v1/headers",
            get(|headers: HeaderMap| async move {
                let all = |name: &str| -> Vec<String> {
                    headers
                        .get_all(name)
                        .iter()
                        .filter_map(|v| v.to_str().ok())
                        .map(str::to_string)
                        .collect()
                };
                Json(json!({
                    "client": all("x-client"),
                    "session": all("sessiontoken"),
                    "trace": all("x-trace-id"),
                }))
            }),
        );
        let client = decorator(&f, router)
            .await
            .with_default_header("X-Client", "default");

        let request = ApiRequest::get("v1/headers")
            .with_header("X-Client", "override")
            .with_header("sessionToken", "other")
            .with_header("X-Trace-Id", "spoofed")
            .with_trace_id("trace-7");
        let seen: Value = client.invoke_for_user("jira", &request).await.unwrap();

        assert_eq!(
            seen,
            json!({ "client": ["override"], "session": ["S1"], "trace": ["trace-7"] })
        );
    }

    #[tokio::test]
    async fn invalid_header_is_rejected_before_sending() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let client = decorator(&f, guarded("S1", hits.clone())).await;

        let err = client
            .invoke_for_user::<Value>(
                "jira",
                &ApiRequest::get("v1/info").with_header("bad header", "x"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::InvalidRequest(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/pod/v1/info",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom")
                }
            }),
        );
        let client = decorator(&f, router).await;
        f.clock.advance(DEFAULT_MAX_SESSION_AGE);

        let err = client
            .invoke_for_user::<Value>("jira", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();

        match err {
            ClientError::Api(api) => {
                assert_eq!(api.status, reqwest::StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(api.message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(f.session.calls(), 1);
    }

    #[tokio::test]
    async fn failed_reauthentication_surfaces_as_auth_error() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let client = decorator(&f, guarded("S2", hits.clone())).await;
        f.clock.advance(DEFAULT_MAX_SESSION_AGE);
        f.session
            .push_err(AuthenticatorError::Api(ApiError::forbidden("disabled")));

        let err = client
            .invoke_with_session::<Value>("S1", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Auth(AuthError::Forbidden { .. })));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_content_decodes_as_null() {
        let f = fixture().await;
        let router = Router::new().route(
            "/pod/v1/streams/1",
            axum::routing::delete(|| async { axum::http::StatusCode::NO_CONTENT }),
        );
        let client = decorator(&f, router).await;

        let result: Option<Value> = client
            .invoke_for_user("jira", &ApiRequest::delete("v1/streams/1"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn malformed_body_is_an_invalid_response() {
        let f = fixture().await;
        let router = Router::new().route("/pod/v1/info", get(|| async { "not json" }));
        let client = decorator(&f, router).await;

        let err = client
            .invoke_for_user::<Value>("jira", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::InvalidResponse {
                service: ServiceName::Pod,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_connectivity_error() {
        let f = fixture().await;
        let client = ApiClientDecorator::new(f.proxy.clone(), ServiceName::Agent, closed_port_url());
        f.clock.advance(DEFAULT_MAX_SESSION_AGE);

        let err = client
            .invoke_for_user::<Value>("jira", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Connectivity {
                service: ServiceName::Agent,
                ..
            }
        ));
        assert_eq!(f.session.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_session_token_is_rejected_before_sending() {
        let f = fixture().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let client = decorator(&f, guarded("S1", hits.clone())).await;

        let err = client
            .invoke_with_session::<Value>("stale", &ApiRequest::get("v1/info"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::Auth(AuthError::UnregisteredSessionToken)
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn url_joins_base_path_and_request_path() {
        let client = ApiClientDecorator::new(
            Arc::new(AuthenticationProxy::new(
                TransportFactory::default(),
                Arc::new(ScriptedAuthenticator::new(ServiceName::SessionAuth, "S")),
                Arc::new(ScriptedAuthenticator::new(ServiceName::KeyAuth, "K")),
            )),
            ServiceName::Pod,
            Url::parse("https://pod.example.com/pod/").unwrap(),
        );

        assert_eq!(
            client.url_for("/v1/info").unwrap().as_str(),
            "https://pod.example.com/pod/v1/info"
        );
        assert_eq!(
            client.url_for("v3/stream/abc/message").unwrap().as_str(),
            "https://pod.example.com/pod/v3/stream/abc/message"
        );
    }
}
