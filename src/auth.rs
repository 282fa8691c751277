use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;
use crate::http_client::{HttpTransport, Method, PreparedRequest};

/// Mutex-guarded bearer token. Refresh is infrequent and blocking is
/// acceptable, so a plain lock serializes concurrent callers. Shares the
/// same [`HttpTransport`] seam as [`crate::http_client::ApiClient`] so both
/// the login call and ordinary requests can be exercised against a fake
/// transport in tests, without a network.
pub struct TokenHolder {
    inner: Mutex<Option<String>>,
    transport: Arc<dyn HttpTransport>,
}

impl TokenHolder {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        TokenHolder {
            inner: Mutex::new(None),
            transport,
        }
    }

    pub fn get(&self) -> Option<String> {
        self.inner.lock().clone()
    }

    pub fn set(&self, token: Option<String>) {
        *self.inner.lock() = token;
    }

    /// POST to `{server}/auth/login`; extracts `data.accessToken` (or
    /// `data.token`). Returns `None` on any failure - callers decide retry
    /// policy.
    pub async fn refresh(&self, config: &Config) -> Option<String> {
        info!(username = %config.device_username, "attempting login");
        let req = PreparedRequest {
            method: Method::Post,
            url: format!("{}/auth/login", config.server_base_url),
            body: Some(json!({
                "username": config.device_username,
                "password": config.device_password,
            })),
            bearer: None,
            timeout: Duration::from_secs(10),
            content_type: Some("application/json".to_string()),
        };

        let response = match self.transport.execute(req).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "login request failed");
                return None;
            }
        };

        if !(200..300).contains(&response.status) {
            warn!(status = response.status, "login rejected");
            return None;
        }

        let token = response
            .json
            .as_ref()
            .and_then(|v| v.get("data"))
            .and_then(|d| {
                d.get("accessToken")
                    .or_else(|| d.get("token"))
                    .and_then(|t| t.as_str())
            })
            .map(str::to_string);

        match token {
            Some(t) => {
                info!("login successful");
                self.set(Some(t.clone()));
                Some(t)
            }
            None => {
                warn!("login ok but no accessToken/token field present");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::TransportResponse;
    use async_trait::async_trait;

    struct NeverCalledTransport;

    #[async_trait]
    impl HttpTransport for NeverCalledTransport {
        async fn execute(&self, _req: PreparedRequest) -> Result<TransportResponse, String> {
            panic!("transport should not be called by get/set");
        }
    }

    #[test]
    fn get_set_round_trip() {
        let holder = TokenHolder::new(Arc::new(NeverCalledTransport));
        assert_eq!(holder.get(), None);
        holder.set(Some("abc".to_string()));
        assert_eq!(holder.get(), Some("abc".to_string()));
        holder.set(None);
        assert_eq!(holder.get(), None);
    }

    struct LoginTransport {
        status: u16,
        body: serde_json::Value,
    }

    #[async_trait]
    impl HttpTransport for LoginTransport {
        async fn execute(&self, req: PreparedRequest) -> Result<TransportResponse, String> {
            assert_eq!(req.url, "http://example.test/auth/login");
            assert_eq!(req.method, Method::Post);
            Ok(TransportResponse {
                status: self.status,
                json: Some(self.body.clone()),
            })
        }
    }

    fn config_for(server_base_url: &str) -> Config {
        std::env::set_var("NUVION_SERVER_BASE_URL", server_base_url);
        let config = Config::from_env().unwrap();
        std::env::remove_var("NUVION_SERVER_BASE_URL");
        config
    }

    #[tokio::test]
    async fn refresh_extracts_access_token_and_stores_it() {
        let transport = LoginTransport {
            status: 200,
            body: json!({"data": {"accessToken": "tok-123"}}),
        };
        let holder = TokenHolder::new(Arc::new(transport));
        let config = config_for("http://example.test");

        let token = holder.refresh(&config).await;
        assert_eq!(token.as_deref(), Some("tok-123"));
        assert_eq!(holder.get().as_deref(), Some("tok-123"));
    }

    #[tokio::test]
    async fn refresh_falls_back_to_token_field() {
        let transport = LoginTransport {
            status: 200,
            body: json!({"data": {"token": "tok-456"}}),
        };
        let holder = TokenHolder::new(Arc::new(transport));
        let config = config_for("http://example.test");

        assert_eq!(holder.refresh(&config).await.as_deref(), Some("tok-456"));
    }

    #[tokio::test]
    async fn refresh_returns_none_on_rejected_login() {
        let transport = LoginTransport {
            status: 401,
            body: json!({}),
        };
        let holder = TokenHolder::new(Arc::new(transport));
        let config = config_for("http://example.test");

        assert!(holder.refresh(&config).await.is_none());
    }
}
