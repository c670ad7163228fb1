// Wire-level HTTP execution.
// The transport talks to the network only through the `Connector` trait.

use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

pub use reqwest::Method;

use crate::error::{Result, SyncError};

/// Request body encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Sent as `application/json`.
    Json(serde_json::Value),
    /// Multipart or binary upload; no content-type override is applied.
    Raw(Vec<u8>),
}

/// A fully resolved request, ready for the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
            timeout: None,
        }
    }

    /// Value of the `Authorization` header, if one is attached.
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(AUTHORIZATION.as_str()))
            .map(|(_, value)| value.as_str())
    }
}

/// Raw response as received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: value.to_string().into_bytes(),
        }
    }
}

/// Executes requests. `Err(NetworkUnavailable)` means no response arrived at all;
/// any response, including error statuses, is `Ok`.
pub trait Connector: Send + Sync {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

/// Connector backed by `reqwest`, with a cookie jar so the refresh cookie
/// is sent on every request.
#[derive(Debug, Clone)]
pub struct ReqwestConnector {
    client: Client,
}

impl ReqwestConnector {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(Self { client })
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SyncError::ValidationFailed(e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SyncError::ValidationFailed(e.to_string()))?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(headers)
            .query(&request.query);

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Raw(bytes) => builder.body(bytes),
        };

        let response = builder.send().await.map_err(|e| {
            tracing::debug!(url = %request.url, error = %e, "No response from server");
            SyncError::NetworkUnavailable
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|_| SyncError::NetworkUnavailable)?
            .to_vec();

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

impl Connector for ReqwestConnector {
    fn execute(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
        self.send(request).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_lookup_is_case_insensitive() {
        let mut request = HttpRequest::new(Method::GET, "http://localhost/x");
        request
            .headers
            .push(("authorization".into(), "Bearer abc".into()));
        assert_eq!(request.authorization(), Some("Bearer abc"));
    }

    #[test]
    fn test_response_status_helpers() {
        let ok = HttpResponse::json(200, &serde_json::json!({}));
        assert!(ok.is_success());
        let denied = HttpResponse::json(401, &serde_json::json!({}));
        assert!(denied.is_unauthorized());
        assert!(!denied.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_unavailable() {
        let connector = ReqwestConnector::new(Duration::from_millis(500)).unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let request = HttpRequest::new(Method::GET, "http://127.0.0.1:9/nothing");
        let err = connector.execute(request).await.unwrap_err();
        assert_eq!(err, SyncError::NetworkUnavailable);
    }
}
