use anyhow::{Context, Result};
use faas_stream::{NatsOptions, StartPosition, SubscriptionSpec};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use crate::lifecycle::ShutdownOptions;
use crate::resolver::PortConvention;
use crate::transport::TransportConfig;

// Worker configuration sourced from environment variables, read once at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    // Message broker address.
    pub nats_url: String,
    // Cluster identifier; names the stream backing the queue subject.
    pub cluster_id: String,
    // Broker client name, unique per connection.
    pub client_id: String,
    // Queue subject carrying invocation requests.
    pub subject: String,
    // Queue group shared by all workers.
    pub queue_group: String,
    // Durable subscription name; empty means non-durable.
    pub durable_name: String,
    // Unsubscribe a durable subscription on exit instead of keeping it.
    pub unsubscribe_on_exit: bool,
    // Where a new durable starts reading.
    pub start_position: StartPosition,
    // Gateway base URL receiving completion reports.
    pub gateway_url: String,
    // Port every function listens on.
    pub function_port: u16,
    // Appended to the function name to build its host.
    pub function_suffix: String,
    // Connect phase timeout for outbound HTTP.
    pub connect_timeout_ms: u64,
    // Idle connection lifetime for outbound HTTP.
    pub idle_timeout_ms: u64,
    // Upper bound on idle outbound connections.
    pub max_idle_connections: usize,
    // Reuse outbound connections between calls.
    pub keep_alive: bool,
    // Optional whole-request deadline; unset means none.
    pub request_timeout_ms: Option<u64>,
    // Max time to wait for the in-flight message on shutdown.
    pub drain_timeout_ms: u64,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
}

const DEFAULT_NATS_URL: &str = "nats://nats:4222";
const DEFAULT_CLUSTER_ID: &str = "faas-cluster";
const DEFAULT_SUBJECT: &str = "faas-request";
const DEFAULT_QUEUE_GROUP: &str = "faas";
const DEFAULT_GATEWAY_URL: &str = "http://gateway:8080";
const DEFAULT_FUNCTION_PORT: u16 = 8080;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 120;
const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 1;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8081";
const CLIENT_ID_PREFIX: &str = "faas-worker-";

#[derive(Debug, Deserialize)]
struct WorkerConfigOverride {
    nats_url: Option<String>,
    cluster_id: Option<String>,
    client_id: Option<String>,
    subject: Option<String>,
    queue_group: Option<String>,
    durable_name: Option<String>,
    unsubscribe_on_exit: Option<bool>,
    start_position: Option<String>,
    gateway_url: Option<String>,
    function_port: Option<u16>,
    function_suffix: Option<String>,
    connect_timeout_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    max_idle_connections: Option<usize>,
    keep_alive: Option<bool>,
    request_timeout_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    metrics_bind: Option<String>,
}

fn env_flag(key: &str) -> Result<Option<bool>> {
    let Ok(value) = std::env::var(key) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
        _ => anyhow::bail!("parse {key}: expected a boolean, got {value:?}"),
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parse {key}: {value:?}")),
        Err(_) => Ok(None),
    }
}

// Zero keeps the default; anything unparsable is an error.
fn env_positive_ms(key: &str) -> Result<Option<u64>> {
    Ok(env_parse::<u64>(key)?.filter(|value| *value > 0))
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("FAAS_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse FAAS_METRICS_BIND")?;
        let start_position = match std::env::var("FAAS_START_POSITION") {
            Ok(value) => value
                .parse::<StartPosition>()
                .with_context(|| "parse FAAS_START_POSITION")?,
            Err(_) => StartPosition::default(),
        };
        let function_port = match std::env::var("FAAS_FUNCTION_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| "parse FAAS_FUNCTION_PORT")?,
            Err(_) => DEFAULT_FUNCTION_PORT,
        };
        let client_id = std::env::var("FAAS_CLIENT_ID")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(default_client_id);
        Ok(Self {
            nats_url: std::env::var("FAAS_NATS_URL")
                .unwrap_or_else(|_| DEFAULT_NATS_URL.to_string()),
            cluster_id: std::env::var("FAAS_CLUSTER_ID")
                .unwrap_or_else(|_| DEFAULT_CLUSTER_ID.to_string()),
            client_id,
            subject: std::env::var("FAAS_QUEUE_SUBJECT")
                .unwrap_or_else(|_| DEFAULT_SUBJECT.to_string()),
            queue_group: std::env::var("FAAS_QUEUE_GROUP")
                .unwrap_or_else(|_| DEFAULT_QUEUE_GROUP.to_string()),
            durable_name: std::env::var("FAAS_DURABLE_NAME").unwrap_or_default(),
            unsubscribe_on_exit: env_flag("FAAS_UNSUBSCRIBE_ON_EXIT")?.unwrap_or(false),
            start_position,
            gateway_url: std::env::var("FAAS_GATEWAY_URL")
                .unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string()),
            function_port,
            function_suffix: std::env::var("FAAS_FUNCTION_SUFFIX").unwrap_or_default(),
            connect_timeout_ms: env_positive_ms("FAAS_CONNECT_TIMEOUT_MS")?
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            idle_timeout_ms: env_positive_ms("FAAS_IDLE_TIMEOUT_MS")?
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
            max_idle_connections: env_parse::<usize>("FAAS_MAX_IDLE_CONNS")?
                .unwrap_or(DEFAULT_MAX_IDLE_CONNECTIONS),
            keep_alive: env_flag("FAAS_KEEP_ALIVE")?.unwrap_or(false),
            request_timeout_ms: env_positive_ms("FAAS_REQUEST_TIMEOUT_MS")?,
            drain_timeout_ms: env_positive_ms("FAAS_DRAIN_TIMEOUT_MS")?
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
            metrics_bind,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FAAS_WORKER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read FAAS_WORKER_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: WorkerConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse worker config yaml")?;
        if let Some(value) = override_cfg.nats_url {
            self.nats_url = value;
        }
        if let Some(value) = override_cfg.cluster_id {
            self.cluster_id = value;
        }
        if let Some(value) = override_cfg.client_id
            && !value.trim().is_empty()
        {
            self.client_id = value;
        }
        if let Some(value) = override_cfg.subject {
            self.subject = value;
        }
        if let Some(value) = override_cfg.queue_group {
            self.queue_group = value;
        }
        if let Some(value) = override_cfg.durable_name {
            self.durable_name = value;
        }
        if let Some(value) = override_cfg.unsubscribe_on_exit {
            self.unsubscribe_on_exit = value;
        }
        if let Some(value) = override_cfg.start_position {
            self.start_position = value
                .parse::<StartPosition>()
                .with_context(|| "parse start_position")?;
        }
        if let Some(value) = override_cfg.gateway_url {
            self.gateway_url = value;
        }
        if let Some(value) = override_cfg.function_port {
            self.function_port = value;
        }
        if let Some(value) = override_cfg.function_suffix {
            self.function_suffix = value;
        }
        if let Some(value) = override_cfg.connect_timeout_ms
            && value > 0
        {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = override_cfg.idle_timeout_ms
            && value > 0
        {
            self.idle_timeout_ms = value;
        }
        if let Some(value) = override_cfg.max_idle_connections {
            self.max_idle_connections = value;
        }
        if let Some(value) = override_cfg.keep_alive {
            self.keep_alive = value;
        }
        if let Some(value) = override_cfg.request_timeout_ms {
            self.request_timeout_ms = (value > 0).then_some(value);
        }
        if let Some(value) = override_cfg.drain_timeout_ms
            && value > 0
        {
            self.drain_timeout_ms = value;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value
                .parse::<SocketAddr>()
                .with_context(|| "parse metrics_bind")?;
        }
        Ok(())
    }

    pub fn nats_options(&self) -> NatsOptions {
        NatsOptions {
            url: self.nats_url.clone(),
            cluster_id: self.cluster_id.clone(),
            client_id: self.client_id.clone(),
        }
    }

    pub fn subscription_spec(&self) -> SubscriptionSpec {
        SubscriptionSpec {
            subject: self.subject.clone(),
            queue_group: self.queue_group.clone(),
            durable_name: self.durable_name.clone(),
            client_id: self.client_id.clone(),
            start_position: self.start_position,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_idle_connections: self.max_idle_connections,
            keep_alive: self.keep_alive,
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn resolver(&self) -> PortConvention {
        PortConvention::new(self.function_port).with_suffix(self.function_suffix.clone())
    }

    pub fn shutdown_options(&self) -> ShutdownOptions {
        ShutdownOptions {
            unsubscribe_on_exit: self.unsubscribe_on_exit,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

// Hostname keeps the client id unique per broker connection.
fn default_client_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            fs::read_to_string("/etc/hostname")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    format!("{CLIENT_ID_PREFIX}{host}")
}
