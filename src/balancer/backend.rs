//! Backend exam servers as seen from the balancer, and the HTTP client
//! used to probe and forward to them.

use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{BackendConfig, BalancerConfig};
use crate::exam::{ExamConfig, ExamInfo, ExamResult};
use crate::error::{Error, Result};

/// One backend exam server
#[derive(Debug, Clone, Serialize)]
pub struct Backend {
    pub id: String,
    /// Base URL, no trailing slash
    pub url: String,
    /// Result of the last probe; optimistic until the first one
    pub healthy: bool,
    /// Sessions reported by the last probe plus local placements since
    pub active_sessions: usize,
    pub capacity: usize,
    pub last_probe: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
}

impl Backend {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into().trim_end_matches('/').to_string(),
            healthy: true,
            active_sessions: 0,
            capacity: 0,
            last_probe: None,
            last_error: None,
        }
    }
}

impl From<&BackendConfig> for Backend {
    fn from(config: &BackendConfig) -> Self {
        Backend::new(config.id.clone(), config.url.clone())
    }
}

/// Load figures returned by a backend's `/metrics`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub active_sessions: usize,
    #[serde(default)]
    pub capacity: usize,
    /// The coordinator that backend currently follows
    #[serde(default)]
    pub leader_id: Option<String>,
}

/// A backend reply passed through to the client as is
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ForwardedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Calls the balancer makes to a backend. Every call is timeout-bounded.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Succeeds only on a success status
    async fn health(&self, url: &str) -> Result<()>;

    async fn metrics(&self, url: &str) -> Result<BackendMetrics>;

    async fn start_exam(&self, url: &str, body: &serde_json::Value) -> Result<ForwardedResponse>;

    async fn submit_answer(&self, url: &str, body: &serde_json::Value) -> Result<ForwardedResponse>;

    async fn configure(&self, url: &str, config: &ExamConfig) -> Result<ForwardedResponse>;

    async fn exam_info(&self, url: &str) -> Result<ExamInfo>;

    async fn results(&self, url: &str) -> Result<Vec<ExamResult>>;
}

#[derive(Deserialize)]
struct ResultsBody {
    #[serde(default)]
    results: Vec<ExamResult>,
}

/// `BackendClient` over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackendClient {
    http: reqwest::Client,
    probe_timeout: Duration,
    forward_timeout: Duration,
    configure_timeout: Duration,
}

impl HttpBackendClient {
    pub fn new(config: &BalancerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.probe_timeout())
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            probe_timeout: config.probe_timeout(),
            forward_timeout: config.forward_timeout(),
            configure_timeout: config.configure_timeout(),
        })
    }

    fn transport_error(url: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(url.to_string())
        } else {
            Error::unreachable(url, e)
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", url, path))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Self::transport_error(url, e))?;

        if !response.status().is_success() {
            return Err(Error::unreachable(url, format!("{} returned {}", path, response.status())));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Protocol(format!("bad {} body from {}: {}", path, url, e)))
    }

    async fn post_forward<B: Serialize + ?Sized>(
        &self,
        url: &str,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<ForwardedResponse> {
        let response = self
            .http
            .post(format!("{}{}", url, path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::transport_error(url, e))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::transport_error(url, e))?;
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);

        Ok(ForwardedResponse { status, body })
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn health(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/health", url))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| Self::transport_error(url, e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::unreachable(url, format!("health returned {}", response.status())))
        }
    }

    async fn metrics(&self, url: &str) -> Result<BackendMetrics> {
        self.get_json(url, "/metrics").await
    }

    async fn start_exam(&self, url: &str, body: &serde_json::Value) -> Result<ForwardedResponse> {
        self.post_forward(url, "/start_exam", body, self.forward_timeout).await
    }

    async fn submit_answer(&self, url: &str, body: &serde_json::Value) -> Result<ForwardedResponse> {
        self.post_forward(url, "/submit_answer", body, self.forward_timeout).await
    }

    async fn configure(&self, url: &str, config: &ExamConfig) -> Result<ForwardedResponse> {
        self.post_forward(url, "/configure_exam", config, self.configure_timeout).await
    }

    async fn exam_info(&self, url: &str) -> Result<ExamInfo> {
        self.get_json(url, "/exam_info").await
    }

    async fn results(&self, url: &str) -> Result<Vec<ExamResult>> {
        let body: ResultsBody = self.get_json(url, "/results").await?;
        Ok(body.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_url_normalized() {
        let backend = Backend::new("S1", "http://localhost:6001/");
        assert_eq!(backend.url, "http://localhost:6001");
        assert!(backend.healthy);
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_health() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let config = BalancerConfig {
            bind_address: "127.0.0.1:0".into(),
            backends: vec![],
            health_check_interval_ms: 1000,
            probe_timeout_ms: 200,
            forward_timeout_ms: 200,
            configure_timeout_ms: 200,
        };
        let client = HttpBackendClient::new(&config).unwrap();

        let err = client.health(&url).await.unwrap_err();
        assert!(err.is_unreachable());
    }
}
