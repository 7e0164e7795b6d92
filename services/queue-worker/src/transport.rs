// Outbound HTTP client shared by function calls and gateway reports.
// Each call opens a fresh connection by default so a single hung target can
// only ever hold the socket of the call that is waiting on it.
use anyhow::{Context, Result};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    // Bound on the TCP connect phase.
    pub connect_timeout: Duration,
    // How long an idle pooled connection may linger.
    pub idle_timeout: Duration,
    // Upper bound on idle pooled connections per host.
    pub max_idle_connections: usize,
    // When false, connections are never returned to the pool.
    pub keep_alive: bool,
    // Whole-request deadline. None leaves slow-but-connected peers unbounded.
    pub request_timeout: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_millis(120),
            max_idle_connections: 1,
            keep_alive: false,
            request_timeout: None,
        }
    }
}

impl TransportConfig {
    fn pooled_idle_per_host(&self) -> usize {
        if self.keep_alive {
            self.max_idle_connections
        } else {
            0
        }
    }
}

/// Builds the process-wide client. Immutable after construction; clone freely.
pub fn build_client(config: &TransportConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .pool_idle_timeout(config.idle_timeout)
        .pool_max_idle_per_host(config.pooled_idle_per_host())
        .tcp_keepalive(Option::<Duration>::None)
        .user_agent(concat!("faas-queue-worker/", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = config.request_timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().context("build outbound http client")
}
