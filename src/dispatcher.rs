//! Round-robin dispatch across a fixed set of backends
//!
//! The dispatcher owns the backends and a single cursor. Selection is lock-free:
//! the cursor is advanced with a compare-and-swap, and the forwarding exchange
//! runs after selection has returned.

use crate::backend::Backend;
use crate::config::Config;
use crate::error::DispatchError;
use crate::liveness::ProbedLiveness;
use crate::pool::ProxyBody;
use anyhow::Context;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Selects a backend per request and forwards the request to it
#[derive(Debug)]
pub struct Dispatcher {
    /// Backends in configuration order
    backends: Vec<Backend>,
    /// Index the next scan starts from, always < backends.len()
    cursor: AtomicUsize,
}

impl Dispatcher {
    pub fn new(backends: Vec<Backend>) -> Result<Self, DispatchError> {
        if backends.is_empty() {
            return Err(DispatchError::NoBackends);
        }

        info!(
            total_backends = backends.len(),
            backends = ?backends.iter().map(Backend::address).collect::<Vec<_>>(),
            "Dispatcher created"
        );

        Ok(Self {
            backends,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Build backends from configuration
    ///
    /// When health checking is enabled each backend gets a probed liveness flag;
    /// the flags are returned in backend order for the health checker to drive.
    pub fn from_config(config: &Config) -> anyhow::Result<(Self, Vec<Arc<ProbedLiveness>>)> {
        let pool_config = config.server.pool_config();
        let mut backends = Vec::with_capacity(config.backends.len());
        let mut probes = Vec::new();

        for address in &config.backends {
            let mut backend = Backend::new(address.as_str(), pool_config.clone())
                .with_context(|| format!("Invalid backend '{}'", address))?;

            if config.health.enabled {
                let liveness = Arc::new(ProbedLiveness::new());
                backend = backend.with_liveness(liveness.clone());
                probes.push(liveness);
            }

            backends.push(backend);
        }

        let dispatcher = Self::new(backends)?;
        Ok((dispatcher, probes))
    }

    /// Pick the next eligible backend in round-robin order
    ///
    /// The scan starts at the cursor and covers at most one full cycle. On success
    /// the cursor moves just past the chosen backend. Returns `None`, leaving the
    /// cursor untouched, when no backend is eligible.
    pub fn select_next(&self) -> Option<&Backend> {
        let len = self.backends.len();
        let mut start = self.cursor.load(Ordering::Acquire);

        loop {
            let idx = (0..len)
                .map(|offset| (start + offset) % len)
                .find(|&idx| self.backends[idx].is_eligible())?;

            let next = (idx + 1) % len;
            match self
                .cursor
                .compare_exchange_weak(start, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(&self.backends[idx]),
                Err(current) => start = current,
            }
        }
    }

    /// Select a backend and forward the request to it
    ///
    /// Failures are reported to this request only; there is no retry against
    /// another backend.
    pub async fn dispatch(
        &self,
        req: Request<ProxyBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let backend = match self.select_next() {
            Some(backend) => backend,
            None => {
                warn!(total_backends = self.backends.len(), "No eligible backend");
                return Err(DispatchError::NoEligibleBackend {
                    total: self.backends.len(),
                });
            }
        };

        debug!(
            backend = backend.address(),
            method = %req.method(),
            uri = %req.uri(),
            "Forwarding request"
        );

        backend
            .forward(req, client_addr)
            .await
            .map_err(|source| DispatchError::Forward {
                address: backend.address().to_string(),
                source,
            })
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Always false: construction rejects an empty backend list
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Current cursor position
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn eligible_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_eligible()).count()
    }
}
