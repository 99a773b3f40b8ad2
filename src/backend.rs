//! Upstream backends
//!
//! A [`Backend`] is one configured upstream server. Its address is validated
//! and parsed once at construction, together with the connection pool used to
//! reach it; both live as long as the backend and are never rebuilt per request.

use crate::error::{AddressError, ForwardError};
use crate::liveness::{AlwaysAlive, LivenessCheck};
use crate::pool::{ConnectionPool, PoolConfig, ProxyBody};
use http::uri::{Authority, PathAndQuery, Scheme};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode, Uri, Version};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Connection-scoped headers that must not travel past a proxy hop
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Parse and validate a backend address
///
/// The address must be an absolute `http` URL with a host. A path and query
/// may be given; they prefix every forwarded request.
pub fn parse_address(address: &str) -> Result<Uri, AddressError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(AddressError::Empty);
    }

    let uri: Uri = trimmed.parse().map_err(|source| AddressError::Malformed {
        address: address.to_string(),
        source,
    })?;

    let scheme = uri
        .scheme_str()
        .ok_or_else(|| AddressError::MissingScheme(address.to_string()))?;
    if !scheme.eq_ignore_ascii_case("http") {
        return Err(AddressError::UnsupportedScheme {
            address: address.to_string(),
            scheme: scheme.to_string(),
        });
    }

    match uri.authority() {
        Some(authority) if !authority.host().is_empty() => Ok(uri),
        _ => Err(AddressError::MissingHost(address.to_string())),
    }
}

/// Pieces of the base address that every forwarded request is built from
#[derive(Debug, Clone)]
struct ForwardTarget {
    scheme: Scheme,
    authority: Authority,
    path: String,
    query: Option<String>,
}

impl ForwardTarget {
    fn from_address(address: &str) -> Result<Self, AddressError> {
        let uri = parse_address(address)?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| AddressError::MissingHost(address.to_string()))?;

        Ok(Self {
            scheme: uri.scheme().cloned().unwrap_or(Scheme::HTTP),
            authority,
            path: uri.path().to_string(),
            query: uri.query().map(String::from),
        })
    }

    /// Rewrite an inbound request URI onto this target
    fn rewrite(&self, inbound: &Uri) -> Result<Uri, ForwardError> {
        let path = join_paths(&self.path, inbound.path());
        let query = merge_queries(self.query.as_deref(), inbound.query());
        let path_and_query = match query {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };

        let path_and_query: PathAndQuery = path_and_query
            .parse()
            .map_err(|e: http::uri::InvalidUri| ForwardError::RequestBuild(e.to_string()))?;

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))
    }
}

/// Join the base path prefix and the request path with exactly one slash
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn merge_queries(base: Option<&str>, inbound: Option<&str>) -> Option<String> {
    match (base.filter(|q| !q.is_empty()), inbound.filter(|q| !q.is_empty())) {
        (Some(b), Some(i)) => Some(format!("{}&{}", b, i)),
        (Some(b), None) => Some(b.to_string()),
        (None, Some(i)) => Some(i.to_string()),
        (None, None) => None,
    }
}

/// Remove hop-by-hop headers, including any named by the Connection header
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// The protocol named by `Upgrade` when `Connection` carries the upgrade token
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Put back the only hop-by-hop headers an upgrade handshake needs
fn restore_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, protocol);
}

/// Append the caller's IP to X-Forwarded-For, keeping every earlier hop
fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let mut hops: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect();
    hops.push(client_addr.ip().to_string());

    if let Ok(value) = HeaderValue::from_str(&hops.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// One upstream server the dispatcher can forward requests to
pub struct Backend {
    address: String,
    target: ForwardTarget,
    pool: ConnectionPool,
    liveness: Arc<dyn LivenessCheck>,
}

impl Backend {
    /// Create a backend that is always eligible
    ///
    /// Surrounding whitespace is dropped from the address before it is stored.
    pub fn new(address: impl Into<String>, pool_config: PoolConfig) -> Result<Self, AddressError> {
        let address = address.into().trim().to_string();

        Ok(Self {
            target: ForwardTarget::from_address(&address)?,
            address,
            pool: ConnectionPool::new(pool_config),
            liveness: Arc::new(AlwaysAlive),
        })
    }

    /// Replace the liveness capability (builder pattern)
    pub fn with_liveness(mut self, liveness: Arc<dyn LivenessCheck>) -> Self {
        self.liveness = liveness;
        self
    }

    /// The configured address, unchanged for the lifetime of the backend
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_eligible(&self) -> bool {
        self.liveness.is_alive()
    }

    /// Number of requests forwarded to this backend so far
    pub fn requests_forwarded(&self) -> u64 {
        self.pool.stats().get_total_requests()
    }

    pub fn failed_requests(&self) -> u64 {
        self.pool.stats().get_failed_requests()
    }

    pub fn probes_sent(&self) -> u64 {
        self.pool.stats().get_health_checks()
    }

    /// Forward one request and return the upstream response
    ///
    /// The original path and query are appended to the backend's base address.
    /// The response body is streamed back untouched. Upgrade handshakes keep
    /// their `Connection`/`Upgrade` pair in both directions; taking over the
    /// upgraded connection is left to the caller.
    pub async fn forward(
        &self,
        req: Request<ProxyBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let (mut parts, body) = req.into_parts();

        parts.uri = self.target.rewrite(&parts.uri)?;
        // The pooled client speaks HTTP/1.1 to backends regardless of the inbound version
        parts.version = Version::HTTP_11;
        let upgrade = upgrade_protocol(&parts.headers);
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = upgrade {
            restore_upgrade(&mut parts.headers, protocol);
        }
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut parts.headers, addr);
        }

        debug!(backend = %self.address, uri = %parts.uri, "Sending request upstream");

        let response = self
            .pool
            .send_request(Request::from_parts(parts, body))
            .await?;

        let (mut parts, body) = response.into_parts();
        let upgrade = if parts.status == StatusCode::SWITCHING_PROTOCOLS {
            upgrade_protocol(&parts.headers)
        } else {
            None
        };
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = upgrade {
            restore_upgrade(&mut parts.headers, protocol);
        }
        Ok(Response::from_parts(parts, body))
    }

    /// Probe `path` (relative to the base address) for a 2xx response
    pub async fn probe(&self, path: &str, timeout: Duration) -> bool {
        let uri = match path.parse::<Uri>() {
            Ok(probe) => match self.target.rewrite(&probe) {
                Ok(uri) => uri,
                Err(_) => return false,
            },
            Err(_) => return false,
        };
        self.pool.check_backend(uri, timeout).await
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address)
            .field("eligible", &self.is_eligible())
            .finish()
    }
}
