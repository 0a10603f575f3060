//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.courier/config.json`) or, for `.yaml`/`.yml`
//! paths, YAML. It supplies the units, the static routing table and the middleware order;
//! it is treated as immutable for the life of the process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message::Metadata;
use crate::routing::{RouteRule, RoutingTable};

/// Fatal configuration problems, detected at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{kind} name must not be empty")]
    EmptyName { kind: &'static str },
    #[error("unit name {0} is used more than once (transport and application names must be unique)")]
    DuplicateUnit(String),
    #[error("route references unknown transport {0}")]
    UnknownTransport(String),
    #[error("route references unknown application {0}")]
    UnknownApplication(String),
    #[error("transport {transport} endpoint {endpoint} routes to both {first} and {second}")]
    AmbiguousInbound {
        transport: String,
        endpoint: String,
        first: String,
        second: String,
    },
    #[error("application {application} endpoint {endpoint} routes to both {first} and {second}")]
    AmbiguousOutbound {
        application: String,
        endpoint: String,
        first: String,
        second: String,
    },
    #[error("transport {0} has no route")]
    UnroutedTransport(String),
    #[error("application {0} has no route")]
    UnroutedApplication(String),
    #[error("middleware name {0} is used more than once")]
    DuplicateMiddleware(String),
    #[error("middleware {name}: {reason}")]
    InvalidMiddleware { name: String, reason: String },
}

/// Top-level gateway config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub transports: Vec<TransportConfig>,

    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,

    /// Inbound rules; each also defines the reverse outbound mapping.
    #[serde(default)]
    pub routes: Vec<RouteRule>,

    /// Middleware in declared order (transport side first).
    #[serde(default)]
    pub middleware: Vec<MiddlewareConfig>,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn transport_names(&self) -> Vec<String> {
        self.transports.iter().map(|t| t.name.clone()).collect()
    }

    pub fn application_names(&self) -> Vec<String> {
        self.applications.iter().map(|a| a.name.clone()).collect()
    }

    /// Build and validate the routing table; any ambiguity or gap is a [`ConfigError`].
    pub fn routing_table(&self) -> Result<RoutingTable, ConfigError> {
        RoutingTable::build(
            &self.transport_names(),
            &self.application_names(),
            &self.routes,
        )
    }
}

/// A transport unit. The adapter itself runs outside this crate and talks over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub name: String,
    #[serde(default)]
    pub kind: ApplicationKind,
}

/// Built-in applications the gateway can host in-process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationKind {
    /// Replies with the content it received.
    #[default]
    Echo,
    /// Hosted elsewhere; the gateway only routes to its channels.
    External,
}

/// One middleware stage, selected by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MiddlewareConfig {
    /// Logs every message and event passing through.
    #[serde(rename_all = "camelCase")]
    Logging {
        #[serde(default)]
        name: Option<String>,
    },
    /// Merges static metadata into every message and event.
    #[serde(rename_all = "camelCase")]
    Tag {
        #[serde(default)]
        name: Option<String>,
        metadata: Metadata,
    },
    /// Drops inbound messages whose content starts with a prefix or whose sender is blocked.
    #[serde(rename_all = "camelCase")]
    Filter {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        content_prefix: Option<String>,
        #[serde(default)]
        blocked_addresses: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
        /// Also filter outbound messages (default false).
        #[serde(default)]
        outbound: bool,
    },
    /// Tracks per-conversation state in the session store and annotates messages with it.
    #[serde(rename_all = "camelCase")]
    Session {
        #[serde(default)]
        name: Option<String>,
        /// Idle sessions expire after this many seconds. Omit to keep them until closed.
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
}

impl MiddlewareConfig {
    /// Stage name: the configured `name` or the stage type.
    pub fn name(&self) -> String {
        let (name, kind) = match self {
            MiddlewareConfig::Logging { name } => (name, "logging"),
            MiddlewareConfig::Tag { name, .. } => (name, "tag"),
            MiddlewareConfig::Filter { name, .. } => (name, "filter"),
            MiddlewareConfig::Session { name, .. } => (name, "session"),
        };
        name.as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(kind)
            .to_string()
    }
}

/// Durable session backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreBackend {
    #[default]
    Memory,
    /// Directory of session records, shared safely between processes.
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Front the durable store with an in-process cache (default true).
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Cache entry lifetime in seconds for sessions without their own expiry (default 300).
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Optimistic write attempts lost to concurrent writers before giving up (default 5).
    #[serde(default = "default_conflict_retries")]
    pub max_conflict_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            cache: default_true(),
            cache_ttl_secs: default_cache_ttl_secs(),
            retry: RetryConfig::default(),
            max_conflict_retries: default_conflict_retries(),
        }
    }
}

/// Bounded exponential backoff for durable store calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts per call, including the first (default 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Unit name used in logs and audit records (default "dispatcher").
    #[serde(default = "default_dispatcher_name")]
    pub name: String,

    /// Message ids remembered for duplicate suppression (default 10000).
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: default_dispatcher_name(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Restarts allowed per unit before it is left stopped (default 5).
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Delay before the first restart; doubles on each further restart (default 500).
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Queue capacity per bus channel (default 256).
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// How long a publish may wait on a full channel before the delivery fails (default 5000).
    ///
    /// The dispatcher forwards one record at a time, so a destination that stays full (an
    /// `external` application with nothing consuming `<name>.inbound`, say) holds up every
    /// other route for up to this long per message. Keep it short when such applications are
    /// routed.
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl RuntimeConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            bus_capacity: default_bus_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefix for every metric name (default "courier.").
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,

    #[serde(default = "default_publish_interval_secs")]
    pub publish_interval_secs: u64,
}

impl MetricsConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs.max(1))
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            prefix: default_metrics_prefix(),
            publish_interval_secs: default_publish_interval_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_conflict_retries() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_dispatcher_name() -> String {
    "dispatcher".to_string()
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_backoff_ms() -> u64 {
    500
}

fn default_bus_capacity() -> usize {
    256
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_metrics_prefix() -> String {
    "courier.".to_string()
}

fn default_publish_interval_secs() -> u64 {
    5
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("COURIER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".courier").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Parse config text; YAML when `path` ends in `.yaml`/`.yml`, JSON otherwise.
pub fn parse_config(text: &str, path: &Path) -> Result<Config> {
    if is_yaml(path) {
        serde_yaml::from_str(text).with_context(|| format!("parsing config from {}", path.display()))
    } else {
        serde_json::from_str(text).with_context(|| format!("parsing config from {}", path.display()))
    }
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&s, &path)?
    };
    Ok((config, path))
}
