//! Connection pool for backend HTTP connections
//!
//! Every backend owns one pool, built when the backend is constructed and
//! reused for every request and health probe sent to it.

use crate::error::ForwardError;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Body type flowing through the proxy in both directions
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests sent through the pool
    total_requests: AtomicU64,
    /// Requests that ended in a transport error or timeout
    failed_requests: AtomicU64,
    /// Total number of health check requests
    health_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Upper bound on a single upstream exchange (until response headers)
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// A connection pool for HTTP connections to one backend
pub struct ConnectionPool {
    /// Main client for proxying requests
    client: Client<HttpConnector, ProxyBody>,
    /// Dedicated client for health checks (uses Empty body type)
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: PoolStats,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(1)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: PoolStats::default(),
            config,
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Send a request whose URI already targets the backend
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        self.stats.record_request();

        let timeout = self.config.request_timeout;
        let response = match tokio::time::timeout(timeout, self.client.request(req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.record_failure();
                return Err(ForwardError::Client(e));
            }
            Err(_) => {
                self.stats.record_failure();
                return Err(ForwardError::Timeout(timeout));
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Probe a URI on the backend; any 2xx within `timeout` counts as healthy
    pub async fn check_backend(&self, uri: Uri, timeout: Duration) -> bool {
        let req = match Request::builder()
            .method("GET")
            .uri(uri)
            .header("Connection", "keep-alive")
            .body(Empty::<Bytes>::new())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        self.stats.record_health_check();

        match tokio::time::timeout(timeout, self.health_client.request(req)).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!(error = %e, "Health probe failed (connection error)");
                false
            }
            Err(_) => {
                debug!("Health probe failed (timeout)");
                false
            }
        }
    }
}
