//! Active health checking for backends
//!
//! Periodically probes every backend and flips its liveness flag once enough
//! consecutive probes agree.

use crate::config::HealthConfig;
use crate::dispatcher::Dispatcher;
use crate::liveness::ProbedLiveness;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between health check rounds
    pub interval: Duration,
    /// Timeout for each health check request
    pub timeout: Duration,
    /// Number of consecutive failures before marking unhealthy
    pub failure_threshold: u32,
    /// Number of consecutive successes before marking healthy
    pub success_threshold: u32,
    /// Path probed on each backend
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            failure_threshold: 3,
            success_threshold: 1,
            path: "/health".to_string(),
        }
    }
}

impl From<&HealthConfig> for HealthCheckConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            path: config.path.clone(),
        }
    }
}

/// Tracks consecutive health check results for a backend
#[derive(Debug)]
struct BackendHealthState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    is_healthy: bool,
}

impl Default for BackendHealthState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            is_healthy: true,
        }
    }
}

impl BackendHealthState {
    /// Record one probe result; returns the new health if it changed
    fn record(&mut self, passed: bool, config: &HealthCheckConfig) -> Option<bool> {
        if passed {
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.consecutive_failures = 0;

            if !self.is_healthy && self.consecutive_successes >= config.success_threshold {
                self.is_healthy = true;
                return Some(true);
            }
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.consecutive_successes = 0;

            if self.is_healthy && self.consecutive_failures >= config.failure_threshold {
                self.is_healthy = false;
                return Some(false);
            }
        }
        None
    }
}

/// Health checker that drives the probed liveness of each backend
pub struct HealthChecker {
    dispatcher: Arc<Dispatcher>,
    probes: Vec<Arc<ProbedLiveness>>,
    config: HealthCheckConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthChecker {
    /// `probes` must hold one flag per backend, in backend order
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        probes: Vec<Arc<ProbedLiveness>>,
        config: HealthCheckConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            probes.len() == dispatcher.len(),
            "expected {} liveness probes, got {}",
            dispatcher.len(),
            probes.len()
        );

        Ok(Self {
            dispatcher,
            probes,
            config,
            shutdown_rx,
        })
    }

    /// Run the health checker until shutdown is signalled
    pub async fn run(mut self) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            path = %self.config.path,
            backends = self.probes.len(),
            "Health checker started"
        );

        let mut health_states: Vec<BackendHealthState> =
            self.probes.iter().map(|_| BackendHealthState::default()).collect();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.check_all_backends(&mut health_states).await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every backend once and apply any health transitions
    async fn check_all_backends(&self, health_states: &mut [BackendHealthState]) {
        let backends = self.dispatcher.backends();

        let checks = backends
            .iter()
            .zip(&self.probes)
            .zip(health_states.iter_mut());

        for ((backend, probe), state) in checks {
            let passed = backend.probe(&self.config.path, self.config.timeout).await;
            debug!(backend = backend.address(), passed, "Health probe");

            match state.record(passed, &self.config) {
                Some(true) => {
                    info!(backend = backend.address(), "Backend is now healthy");
                    probe.set_alive(true);
                }
                Some(false) => {
                    warn!(
                        backend = backend.address(),
                        failures = state.consecutive_failures,
                        probes_sent = backend.probes_sent(),
                        "Backend is now unhealthy"
                    );
                    probe.set_alive(false);
                }
                None => {}
            }
        }
    }
}
