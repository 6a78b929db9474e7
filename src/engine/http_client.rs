use async_trait::async_trait;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

use crate::error::TransportError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Sends one request and returns the fully-read response.
///
/// The engine only ever talks to the target through this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request<String>) -> Result<Response<Bytes>, TransportError>;
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HttpClient {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_pool_and_workers(2000, 1000, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client with pool size and worker-scaled HTTP/2 windows.
    /// At high worker counts (>5K), use smaller windows to reduce memory.
    pub fn with_pool_and_workers(
        pool_size: usize,
        total_workers: usize,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| TransportError::Connection(format!("loading native roots: {}", e)))?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let (conn_window, stream_window) = if total_workers > 5000 {
            (128 * 1024, 64 * 1024)
        } else if total_workers > 2000 {
            (256 * 1024, 128 * 1024)
        } else {
            (512 * 1024, 256 * 1024)
        };

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .http2_initial_connection_window_size(conn_window)
            .http2_initial_stream_window_size(stream_window)
            .build(https);

        Ok(Self { client, timeout })
    }

    /// ~1 idle connection per 5 workers, between 500 and 2000.
    pub fn pool_size_for_workers(total_workers: usize) -> usize {
        (total_workers / 5).clamp(500, 2000)
    }
}

#[async_trait]
impl Transport for HttpClient {
    // Must be called inside a Tokio runtime
    async fn send(&self, request: Request<String>) -> Result<Response<Bytes>, TransportError> {
        let (parts, body) = request.into_parts();
        let request = Request::from_parts(parts, Full::new(Bytes::from(body)));

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            // Always read the body to completion so the connection can be reused
            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?
                .to_bytes();
            Ok(Response::from_parts(parts, body))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
    }
}
