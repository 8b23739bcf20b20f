//! Outbound HTTP
//!
//! Every network call the engine makes goes through [`Transport::execute`].
//! `.onion` hosts are routed through the configured Tor SOCKS proxy.

use async_trait::async_trait;
use http::Method;
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use std::time::Instant;

use super::handle::is_onion_host;
use crate::config::FederationConfig;
use crate::error::{AppError, Result};
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

const USER_AGENT: &str = concat!("boardfed/", env!("CARGO_PKG_VERSION"));

/// Request handed to a [`Transport`]
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Status and body of a completed request
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl OutboundResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| AppError::Federation(format!("Failed to decode response: {}", e)))
    }
}

/// Outbound HTTP collaborator
///
/// Transport errors are `Err`; any HTTP status, including errors, is `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse>;
}

/// `reqwest`-backed transport
pub struct HttpTransport {
    direct: reqwest::Client,
    /// Client routed through the Tor SOCKS proxy
    onion: Option<reqwest::Client>,
}

impl HttpTransport {
    /// # Errors
    /// Returns error if the proxy URL is invalid or a client fails to build
    pub fn new(config: &FederationConfig) -> Result<Self> {
        let direct = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()?;

        let onion = config
            .tor_proxy
            .as_deref()
            .map(|proxy_url| {
                let proxy = reqwest::Proxy::all(proxy_url)?;
                reqwest::Client::builder()
                    .user_agent(USER_AGENT)
                    .timeout(config.request_timeout())
                    .proxy(proxy)
                    .build()
            })
            .transpose()?;

        Ok(Self { direct, onion })
    }

    fn client_for(&self, url: &url::Url) -> Result<&reqwest::Client> {
        let host = url.host_str().unwrap_or_default();
        if !is_onion_host(host) {
            return Ok(&self.direct);
        }
        self.onion.as_ref().ok_or_else(|| {
            AppError::Federation(format!(
                "No Tor proxy configured; cannot reach {}",
                host
            ))
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", request.url, e)))?;
        let client = self.client_for(&url)?;

        let mut builder = client.request(request.method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let started = Instant::now();
        let result = builder.send().await;
        FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["outbound"])
            .observe(started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                FEDERATION_REQUESTS_TOTAL
                    .with_label_values(&["outbound", "error"])
                    .inc();
                return Err(error.into());
            }
        };

        let status = response.status().as_u16();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["outbound", &status.to_string()])
            .inc();

        let body = response.bytes().await?.to_vec();
        Ok(OutboundResponse { status, body })
    }
}

/// In-memory transport that records requests and replays canned responses
///
/// Responses are matched by method and exact URL; unmatched requests get
/// a 404. Used to run the engine without a network.
#[derive(Default)]
pub struct RecordingTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<OutboundRequest>>,
}

struct Route {
    method: Method,
    url: String,
    /// Served in order; the last one repeats
    responses: Vec<OutboundResponse>,
    served: usize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` as JSON for `GET url`
    pub fn on_get(&self, url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) {
        self.route(Method::GET, url, vec![OutboundResponse::new(status, body)]);
    }

    /// Answer `POST url` with `statuses` in order, repeating the last
    pub fn on_post(&self, url: impl Into<String>, statuses: &[u16]) {
        let responses = statuses
            .iter()
            .map(|status| OutboundResponse::new(*status, Vec::new()))
            .collect();
        self.route(Method::POST, url, responses);
    }

    fn route(&self, method: Method, url: impl Into<String>, responses: Vec<OutboundResponse>) {
        let url = url.into();
        if let Ok(mut routes) = self.routes.lock() {
            routes.retain(|route| !(route.method == method && route.url == url));
            routes.push(Route {
                method,
                url,
                responses,
                served: 0,
            });
        }
    }

    /// Every request executed so far
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    /// Requests with `method` to `url`
    pub fn requests_to(&self, method: Method, url: &str) -> Vec<OutboundRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.method == method && request.url == url)
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        let response = {
            let mut routes = self
                .routes
                .lock()
                .map_err(|_| AppError::Internal(anyhow::anyhow!("transport routes poisoned")))?;
            routes
                .iter_mut()
                .find(|route| route.method == request.method && route.url == request.url)
                .and_then(|route| {
                    let index = route.served.min(route.responses.len().saturating_sub(1));
                    route.served += 1;
                    route.responses.get(index).cloned()
                })
                .unwrap_or_else(|| OutboundResponse::new(404, Vec::new()))
        };

        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        Ok(response)
    }
}
