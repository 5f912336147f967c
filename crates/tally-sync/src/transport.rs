//! # Network Transport
//!
//! Reachability checks and HTTP delivery for batches and remote config.
//!
//! ## Response Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    send(url, body) outcomes                             │
//! │                                                                         │
//! │  POST url  (Content-Type: application/json,                            │
//! │             X-AF-CLIENT-TS: <epoch ms>, X_AF_DEBUG: 0|1)               │
//! │       │                                                                 │
//! │       ├── 2xx ─────────────► Ok(RemoteResponse)   success              │
//! │       ├── 3xx / 4xx ───────► Ok(RemoteResponse)   try next endpoint    │
//! │       ├── 5xx ─────────────► Err(ServiceUnavailable { Retry-After })   │
//! │       ├── bad URL ─────────► Err(MalformedUrl)    transient            │
//! │       └── connect/timeout ─► Err(Io)              transient            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Blocked Hosts
//! Some networks resolve collector hosts to loopback to block telemetry.
//! [`HttpService::check_is_blocked`] resolves every configured host once;
//! if any comes back as loopback or unspecified, the service reports
//! offline for the rest of its life.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use tally_core::RemoteConfigDecision;

use crate::config::TallyConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote_config::RemoteConfigSource;

/// Client timestamp header.
pub const CLIENT_TS_HEADER: &str = "X-AF-CLIENT-TS";

/// Debug flag header.
pub const DEBUG_HEADER: &str = "X_AF_DEBUG";

// =============================================================================
// Offline Mode
// =============================================================================

/// Caller-supplied override that forces the transport offline.
pub trait OfflineMode: Send + Sync {
    fn is_offline(&self) -> bool;
}

/// An [`OfflineMode`] backed by an atomic flag the host can flip at runtime.
#[derive(Debug, Default)]
pub struct OfflineSwitch {
    offline: AtomicBool,
}

impl OfflineSwitch {
    pub fn new(offline: bool) -> Self {
        OfflineSwitch {
            offline: AtomicBool::new(offline),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl OfflineMode for OfflineSwitch {
    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Remote Service
// =============================================================================

/// Status line and body of a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub message: String,
    pub body: String,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The HTTP seam used by the delivery pipeline.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Whether requests should be attempted at all.
    async fn is_online(&self, offline_mode: Option<&dyn OfflineMode>) -> bool;

    /// POSTs `body` to `url`.
    async fn send(&self, url: &str, body: &str) -> SyncResult<RemoteResponse>;

    /// One-time probe for hosts that resolve to blocked addresses.
    async fn check_is_blocked(&self) {}
}

// =============================================================================
// HTTP Service
// =============================================================================

/// [`RemoteService`] and [`RemoteConfigSource`] over reqwest.
#[derive(Debug)]
pub struct HttpService {
    client: Client,
    debug: bool,
    hosts: Vec<(String, u16)>,
    remote_config_endpoint: Option<String>,
    blocked: AtomicBool,
}

impl HttpService {
    /// Builds a client with the configured timeouts. No automatic retries.
    pub fn new(config: &TallyConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        let delivery = &config.delivery;
        let hosts = delivery
            .events_endpoints
            .iter()
            .chain(delivery.profile_endpoints.iter())
            .chain(delivery.remote_config_endpoint.iter())
            .filter_map(|endpoint| resolvable_host(endpoint))
            .collect();

        Ok(HttpService {
            client,
            debug: delivery.debug,
            hosts,
            remote_config_endpoint: delivery.remote_config_endpoint.clone(),
            blocked: AtomicBool::new(false),
        })
    }

    /// True once a configured host resolved to a blocked address.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    fn client_timestamp() -> String {
        Utc::now().timestamp_millis().to_string()
    }
}

#[async_trait]
impl RemoteService for HttpService {
    async fn is_online(&self, offline_mode: Option<&dyn OfflineMode>) -> bool {
        if offline_mode.is_some_and(|mode| mode.is_offline()) {
            debug!("Offline mode override active");
            return false;
        }
        !self.is_blocked()
    }

    async fn send(&self, url: &str, body: &str) -> SyncResult<RemoteResponse> {
        let url = Url::parse(url)?;

        debug!(url = %url, bytes = body.len(), "Sending batch");

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(CLIENT_TS_HEADER, Self::client_timestamp())
            .header(DEBUG_HEADER, if self.debug { "1" } else { "0" })
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SyncError::service_unavailable(parse_retry_after(
                response.headers(),
            )));
        }

        let message = status.canonical_reason().unwrap_or_default().to_string();
        let body = response.text().await?;

        Ok(RemoteResponse {
            status: status.as_u16(),
            message,
            body,
        })
    }

    async fn check_is_blocked(&self) {
        for (host, port) in &self.hosts {
            let addrs = match tokio::net::lookup_host((host.as_str(), *port)).await {
                Ok(addrs) => addrs,
                Err(e) => {
                    debug!(host = %host, error = %e, "Host lookup failed");
                    continue;
                }
            };

            if let Some(addr) = addrs.map(|a| a.ip()).find(is_blocked_address) {
                warn!(host = %host, ip = %addr, "Collector host is blocked, staying offline");
                self.blocked.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

#[async_trait]
impl RemoteConfigSource for HttpService {
    async fn fetch(&self, token: &str) -> SyncResult<RemoteConfigDecision> {
        let endpoint = self
            .remote_config_endpoint
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("No remote config endpoint".into()))?;

        let url = Url::parse_with_params(
            endpoint,
            &[("version", "1"), ("lib", "rust"), ("token", token)],
        )?;

        debug!(url = %url, "Fetching remote config");

        let response = self
            .client
            .get(url)
            .header(CLIENT_TS_HEADER, Self::client_timestamp())
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SyncError::service_unavailable(parse_retry_after(
                response.headers(),
            )));
        }
        if !status.is_success() {
            return Err(SyncError::Io(format!("remote config HTTP {}", status)));
        }

        let body: serde_json::Value = response.json().await?;
        Ok(RemoteConfigDecision::from_response(body))
    }
}

/// Retry-After in whole seconds; absent or unparseable means 0.
pub fn parse_retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

/// Host and port worth resolving. IP literals and `localhost` were chosen
/// on purpose and are never treated as blocked.
fn resolvable_host(endpoint: &str) -> Option<(String, u16)> {
    let url = Url::parse(endpoint).ok()?;
    let port = url.port_or_known_default()?;
    match url.host()? {
        url::Host::Domain(domain) if domain != "localhost" => Some((domain.to_string(), port)),
        _ => None,
    }
}

fn is_blocked_address(ip: &IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response and returns the raw request it received.
    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}", addr), handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..split]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= split + 4 + length
    }

    fn service() -> HttpService {
        HttpService::new(&TallyConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), 0);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(parse_retry_after(&headers), 30);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), 0);
    }

    #[test]
    fn test_resolvable_hosts_skip_literals() {
        assert_eq!(
            resolvable_host("https://collector.example.com/track"),
            Some(("collector.example.com".to_string(), 443))
        );
        assert_eq!(resolvable_host("http://127.0.0.1:8080/track"), None);
        assert_eq!(resolvable_host("http://localhost:8080/track"), None);
        assert!(is_blocked_address(&"0.0.0.0".parse().unwrap()));
        assert!(!is_blocked_address(&"93.184.216.34".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_offline_override() {
        let service = service();
        let switch = OfflineSwitch::new(false);

        assert!(service.is_online(None).await);
        assert!(service.is_online(Some(&switch)).await);

        switch.set_offline(true);
        assert!(!service.is_online(Some(&switch)).await);
    }

    #[tokio::test]
    async fn test_send_success_carries_headers() {
        let (base, server) =
            serve_once("HTTP/1.1 200 OK\r\nContent-Length: 1\r\nConnection: close\r\n\r\n1").await;

        let response = service()
            .send(&format!("{}/track", base), r#"[{"event":"open"}]"#)
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.body, "1");

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /track"));
        assert!(request.contains("content-type: application/json"));
        assert!(request.contains("x-af-client-ts:"));
        assert!(request.contains("x_af_debug: 0"));
        assert!(request.ends_with(r#"[{"event":"open"}]"#));
    }

    #[tokio::test]
    async fn test_server_error_is_service_unavailable() {
        let (base, _server) = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nRetry-After: 30\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let err = service().send(&format!("{}/track", base), "[]").await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_client_error_is_not_success() {
        let (base, _server) = serve_once(
            "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let response = service().send(&format!("{}/track", base), "[]").await.unwrap();
        assert_eq!(response.status, 400);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn test_malformed_url_is_transient() {
        let err = service().send("not a url", "[]").await.unwrap_err();
        assert!(matches!(err, SyncError::MalformedUrl(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_remote_config_fetch() {
        let body = r#"{"automatic_events":true}"#;
        let (base, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 25\r\nConnection: close\r\n\r\n{\"automatic_events\":true}",
        )
        .await;
        assert_eq!(body.len(), 25);

        let mut config = TallyConfig::default();
        config.delivery.remote_config_endpoint = Some(format!("{}/decide", base));
        let service = HttpService::new(&config).unwrap();

        let decision = service.fetch("abc").await.unwrap();
        assert!(decision.tracks_automatic());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /decide?version=1&lib=rust&token=abc"));
    }
}
