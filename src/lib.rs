//! Roundgate - a round-robin reverse proxy load balancer
//!
//! This library provides a reverse proxy that:
//! - Accepts HTTP/1.1 and HTTP/2 traffic on a single port
//! - Forwards each request to one of a fixed list of backends, in round-robin order
//! - Skips backends whose liveness check reports them ineligible
//! - Optionally probes backends periodically to drive that liveness
//! - Uses one pooled HTTP client per backend, built once at startup

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod healthcheck;
pub mod liveness;
pub mod pool;
pub mod proxy;
