//! HTTP transport seam.
//!
//! The client core talks to the network through [`Transport`] so the
//! multipart and credential paths can be exercised against a recording
//! stub. The production implementation wraps a tuned hyper client.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use std::time::Duration;

/// One request/response round-trip. Implementations must be safe for
/// concurrent use; the client shares a single transport across all
/// operations and worker tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// Production transport: hyper with HTTP/1.1, native-tls, and a tuned
/// connection pool (TCP_NODELAY, 90s keepalive, 1024 idle per host).
pub struct HyperTransport {
    client: HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HyperTransport {
    pub fn new(timeout: Duration, insecure_tls: bool) -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(10)));
        http.set_keepalive(Some(Duration::from_secs(90)));

        let tls = if insecure_tls {
            tracing::warn!("insecure TLS mode enabled: certificate verification is disabled");
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| Error::Configuration(format!("failed to build TLS connector: {}", e)))?
        } else {
            TlsConnector::new()
                .map_err(|e| Error::Configuration(format!("failed to build TLS connector: {}", e)))?
        };

        let https = HttpsConnector::from((http, tls.into()));

        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(1024)
            .retry_canceled_requests(true)
            .set_host(true)
            .build(https);

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, Full::new(body));

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| Error::Transport("request timed out".into()))?
            .map_err(|e| Error::Transport(format!("request failed: {}", e)))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| Error::Transport(format!("body read failed: {}", e)))?
            .to_bytes();

        Ok(Response::from_parts(parts, body))
    }
}
