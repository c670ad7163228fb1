// Authenticated HTTP transport.
// Handles credential attachment, single-flight refresh, one retry, and error normalization.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::{Credential, CredentialStore};
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{Result, SyncError};

use super::connector::{Connector, HttpRequest, HttpResponse, Method, RequestBody};
use super::payload::Payload;

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential>>>;

/// Per-call request tweaks.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Body of a successful refresh. Accepts both camelCase and snake_case.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "access_token", rename = "accessToken")]
    access_token: String,
    #[serde(alias = "expires_in", rename = "expiresIn", default)]
    expires_in: Option<i64>,
}

/// The one way the sync core reaches the server.
pub struct Transport {
    connector: Arc<dyn Connector>,
    credentials: Arc<CredentialStore>,
    connectivity: Connectivity,
    base_url: String,
    refresh_path: String,
    timeout: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    /// In-flight refresh shared by every caller that needs one.
    refresh: Arc<Mutex<Option<RefreshFuture>>>,
}

impl Transport {
    pub fn new(
        config: &SyncConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<CredentialStore>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            connector,
            credentials,
            connectivity,
            base_url: config.base_url().to_string(),
            refresh_path: config.refresh_path.clone(),
            timeout: config.request_timeout(),
            reconnect_initial: config.reconnect_initial(),
            reconnect_max: config.reconnect_max(),
            refresh: Arc::new(Mutex::new(None)),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Issue an authenticated request and decode the response.
    ///
    /// A missing credential triggers a refresh before the request; a 401 triggers
    /// exactly one refresh and one retry. A failed refresh after a 401 clears the
    /// credential store and yields `SessionExpired`.
    pub async fn send(
        &self,
        endpoint: &str,
        method: Method,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<Payload> {
        let credential = match self.credentials.get() {
            Some(credential) => credential,
            None => {
                tracing::debug!(endpoint, "No credential, refreshing before request");
                self.refresh().await.map_err(|e| match e {
                    SyncError::NetworkUnavailable => e,
                    _ => SyncError::Unauthenticated,
                })?
            }
        };

        let response = self
            .execute(self.build(endpoint, &method, &body, &options, &credential))
            .await?;
        if !response.is_unauthorized() {
            return self.finish(endpoint, response);
        }

        // Another caller may already have swapped in a fresh credential.
        let retry_credential = match self.credentials.get() {
            Some(current) if current != credential => current,
            _ => {
                tracing::debug!(endpoint, "Credential rejected, refreshing");
                self.refresh().await.map_err(|e| match e {
                    SyncError::NetworkUnavailable => e,
                    _ => SyncError::SessionExpired,
                })?
            }
        };

        let response = self
            .execute(self.build(endpoint, &method, &body, &options, &retry_credential))
            .await?;
        if response.is_unauthorized() {
            tracing::warn!(endpoint, "Refreshed credential rejected, ending session");
            self.credentials.clear();
            return Err(SyncError::SessionExpired);
        }
        self.finish(endpoint, response)
    }

    /// GET and deserialize a JSON response.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T> {
        self.send(endpoint, Method::GET, RequestBody::Empty, options)
            .await?
            .into_json()
    }

    /// Send a JSON body and return the decoded JSON response.
    pub async fn send_json(&self, endpoint: &str, method: Method, body: Value) -> Result<Value> {
        let payload = self
            .send(endpoint, method, RequestBody::Json(body), RequestOptions::new())
            .await?;
        Ok(payload.into_value())
    }

    /// Refresh the access credential. Concurrent callers share one attempt.
    pub fn refresh(&self) -> RefreshFuture {
        let mut slot = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(in_flight) = slot.as_ref() {
            return in_flight.clone();
        }

        let connector = self.connector.clone();
        let credentials = self.credentials.clone();
        let connectivity = self.connectivity.clone();
        let request = HttpRequest {
            timeout: Some(self.timeout),
            ..HttpRequest::new(Method::POST, format!("{}{}", self.base_url, self.refresh_path))
        };
        let release = self.refresh.clone();

        let attempt = async move {
            let result = match connector.execute(request).await {
                Ok(response) => parse_refresh(response),
                Err(e) => Err(e),
            };
            match &result {
                Ok(credential) => {
                    tracing::info!("Access credential refreshed");
                    connectivity.set_online(true);
                    credentials.set(credential.clone());
                }
                Err(SyncError::NetworkUnavailable) => {
                    tracing::warn!("Credential refresh could not reach the server");
                    connectivity.set_online(false);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Credential refresh failed, clearing session");
                    credentials.clear();
                }
            }
            release.lock().unwrap_or_else(|e| e.into_inner()).take();
            result
        }
        .boxed()
        .shared();

        *slot = Some(attempt.clone());
        attempt
    }

    /// Whether the server answers at all. Any status counts, so no credential
    /// is attached and none is refreshed.
    pub async fn probe(&self) -> bool {
        let request = HttpRequest {
            timeout: Some(self.timeout),
            ..HttpRequest::new(Method::GET, self.base_url.clone())
        };
        self.execute(request).await.is_ok()
    }

    /// Wait for connectivity to return, probing the server with exponential
    /// backoff so recovery is noticed even when the host never reports it.
    pub async fn reconnect(&self) {
        let mut delay = self.reconnect_initial;
        while !self.connectivity.is_online() {
            tokio::select! {
                _ = self.connectivity.wait_online() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.probe().await {
                tracing::info!("Server reachable again");
                return;
            }
            tracing::debug!(retry_in = ?delay, "Server still unreachable");
            delay = (delay * 2).min(self.reconnect_max);
        }
    }

    fn build(
        &self,
        endpoint: &str,
        method: &Method,
        body: &RequestBody,
        options: &RequestOptions,
        credential: &Credential,
    ) -> HttpRequest {
        let mut headers = options.headers.clone();
        headers.push(("Authorization".to_string(), credential.bearer()));
        HttpRequest {
            method: method.clone(),
            url: format!("{}{}", self.base_url, endpoint),
            headers,
            query: options.query.clone(),
            body: body.clone(),
            timeout: Some(options.timeout.unwrap_or(self.timeout)),
        }
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        tracing::debug!(method = %request.method, url = %request.url, "Sending request");
        match self.connector.execute(request).await {
            Ok(response) => {
                self.connectivity.set_online(true);
                Ok(response)
            }
            Err(SyncError::NetworkUnavailable) => {
                self.connectivity.set_online(false);
                Err(SyncError::NetworkUnavailable)
            }
            Err(e) => Err(e),
        }
    }

    fn finish(&self, endpoint: &str, response: HttpResponse) -> Result<Payload> {
        if response.is_success() {
            return Payload::decode(response);
        }
        let message = error_message(&response);
        tracing::debug!(endpoint, status = response.status, %message, "Request rejected");
        Err(SyncError::RequestFailed(message))
    }
}

fn parse_refresh(response: HttpResponse) -> Result<Credential> {
    if !response.is_success() {
        return Err(SyncError::SessionExpired);
    }
    let body: RefreshResponse =
        serde_json::from_slice(&response.body).map_err(|_| SyncError::SessionExpired)?;
    let mut credential = Credential::new(body.access_token);
    if let Some(seconds) = body.expires_in {
        credential = credential.with_expiry(Utc::now() + chrono::Duration::seconds(seconds));
    }
    Ok(credential)
}

/// Pull a human-readable message out of an error response.
fn error_message(response: &HttpResponse) -> String {
    let text = String::from_utf8_lossy(&response.body);
    if let Ok(Value::Object(body)) = serde_json::from_str::<Value>(&text) {
        for field in ["message", "error"] {
            if let Some(Value::String(message)) = body.get(field) {
                return message.clone();
            }
        }
    }
    format!("HTTP {}: {}", response.status, text)
}
