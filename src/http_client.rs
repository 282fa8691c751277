use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::auth::TokenHolder;
use crate::config::Config;

/// HTTP method used by a [`PreparedRequest`]. Kept minimal - this agent
/// only ever speaks GET/POST/PATCH/PUT to the signaling server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
}

impl Method {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Put => reqwest::Method::PUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    pub bearer: Option<String>,
    pub timeout: Duration,
    pub content_type: Option<String>,
}

#[derive(Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub json: Option<Value>,
}

/// Seam between the retry algorithm and the wire. Production code talks to
/// `reqwest::Client`; tests can swap in a fake that scripts status codes,
/// exercising the 401-retry-once logic without a network.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, req: PreparedRequest) -> Result<TransportResponse, String>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client) -> Self {
        ReqwestTransport { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, req: PreparedRequest) -> Result<TransportResponse, String> {
        let mut builder = self
            .client
            .request(req.method.as_reqwest(), &req.url)
            .timeout(req.timeout);

        if let Some(ct) = &req.content_type {
            builder = builder.header("Content-Type", ct.as_str());
        }
        if let Some(token) = &req.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let json = response.json::<Value>().await.ok();
        Ok(TransportResponse { status, json })
    }
}

/// Authenticated JSON request/response client with one silent re-auth
/// retry.
pub struct ApiClient {
    transport: std::sync::Arc<dyn HttpTransport>,
    token: std::sync::Arc<TokenHolder>,
    server_base_url: String,
}

impl ApiClient {
    pub fn new(
        transport: std::sync::Arc<dyn HttpTransport>,
        token: std::sync::Arc<TokenHolder>,
        server_base_url: String,
    ) -> Self {
        ApiClient {
            transport,
            token,
            server_base_url,
        }
    }

    /// `request(method, path, body?) -> json|none`. On HTTP 401 (with
    /// `retry=true`, the default) the token is cleared, refreshed, and the
    /// call is retried exactly once. Every other error or non-2xx response
    /// is logged and returns `None` - no exceptions surface to callers.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        config: &Config,
    ) -> Option<Value> {
        self.request_with_retry(method, path, body, config, true)
            .await
    }

    async fn request_with_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        config: &Config,
        retry: bool,
    ) -> Option<Value> {
        let token = match self.token.get() {
            Some(t) => Some(t),
            None => self.token.refresh(config).await,
        };

        let url = format!("{}{}", self.server_base_url, path);
        let req = PreparedRequest {
            method,
            url: url.clone(),
            body: body.clone(),
            bearer: token,
            timeout: Duration::from_secs(10),
            content_type: Some("application/json".to_string()),
        };

        let response = match self.transport.execute(req).await {
            Ok(r) => r,
            Err(e) => {
                warn!(method = ?method, path, error = %e, "http request error");
                return None;
            }
        };

        if response.status == 401 && retry {
            self.token.set(None);
            if self.token.refresh(config).await.is_some() {
                return Box::pin(self.request_with_retry(method, path, body, config, false)).await;
            }
            warn!(method = ?method, path, "401 and refresh failed");
            return None;
        }

        if !(200..300).contains(&response.status) {
            warn!(method = ?method, path, status = response.status, "http request failed");
            return None;
        }

        response.json
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripts responses for ordinary calls and, separately, for the
    /// `/auth/login` refresh call so a single transport can be shared
    /// between [`ApiClient`] and [`TokenHolder`] without a network.
    struct ScriptedTransport {
        login_status: u16,
        login_body: Option<Value>,
        responses: Vec<(u16, Option<Value>)>,
        calls: AtomicUsize,
        login_calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, req: PreparedRequest) -> Result<TransportResponse, String> {
            if req.url.ends_with("/auth/login") {
                self.login_calls.fetch_add(1, Ordering::SeqCst);
                return Ok(TransportResponse {
                    status: self.login_status,
                    json: self.login_body.clone(),
                });
            }
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let (status, json) = self.responses[idx.min(self.responses.len() - 1)].clone();
            Ok(TransportResponse { status, json })
        }
    }

    fn test_config() -> Config {
        std::env::set_var("NUVION_DEVICE_USERNAME", "device");
        Config::from_env().unwrap()
    }

    #[tokio::test]
    async fn retries_exactly_once_on_401() {
        let transport = Arc::new(ScriptedTransport {
            login_status: 200,
            login_body: Some(serde_json::json!({"data": {"accessToken": "fresh-token"}})),
            responses: vec![
                (401, None),
                (200, Some(serde_json::json!({"data": {"objectName": "o1", "uploadUrl": "https://s/u"}}))),
            ],
            calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
        });
        let token = Arc::new(TokenHolder::new(transport.clone()));
        token.set(Some("stale".to_string()));
        let client = ApiClient::new(transport.clone(), token.clone(), "http://localhost".to_string());

        let config = test_config();
        let result = client
            .request(Method::Post, "/devices/media/upload-url", None, &config)
            .await;

        assert_eq!(
            transport.calls.load(Ordering::SeqCst),
            2,
            "the scripted transport must see exactly the 401 then the retried 200"
        );
        assert_eq!(transport.login_calls.load(Ordering::SeqCst), 1, "exactly one refresh call");
        assert_eq!(token.get().as_deref(), Some("fresh-token"));
        assert_eq!(
            result.and_then(|v| v.get("data").cloned()),
            Some(serde_json::json!({"objectName": "o1", "uploadUrl": "https://s/u"}))
        );
    }

    #[tokio::test]
    async fn non_401_failure_returns_none_without_retry() {
        let transport = Arc::new(ScriptedTransport {
            login_status: 200,
            login_body: None,
            responses: vec![(500, None)],
            calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
        });
        let token = Arc::new(TokenHolder::new(transport.clone()));
        token.set(Some("tok".to_string()));
        let client = ApiClient::new(transport.clone(), token, "http://localhost".to_string());
        let config = test_config();
        let result = client.request(Method::Get, "/x", None, &config).await;
        assert!(result.is_none());
        assert_eq!(transport.login_calls.load(Ordering::SeqCst), 0, "no refresh on a non-401 failure");
    }
}
