use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::cli::CliConfig;
use super::constants::{
    APP_DOT_FOLDER, CONFIG_FILE_NAME, DEFAULT_BATCH_SIZE, DEFAULT_BLOCK_MS,
    DEFAULT_CLAIM_INTERVAL_SECS, DEFAULT_CLAIM_MIN_IDLE_MS, DEFAULT_CONNECT_ATTEMPTS,
    DEFAULT_CONNECT_BASE_DELAY_MS, DEFAULT_CONSUMER_GROUP, DEFAULT_EVICTION_INTERVAL_SECS,
    DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TOPIC,
};

// =============================================================================
// Bus Backend Enum
// =============================================================================

/// Message bus backend carrying OTLP metric batches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    #[default]
    Memory,
    Redis,
}

impl BusBackend {
    /// Only publishers in this process can reach the bus
    pub fn is_process_local(self) -> bool {
        matches!(self, BusBackend::Memory)
    }
}

impl fmt::Display for BusBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusBackend::Memory => write!(f, "memory"),
            BusBackend::Redis => write!(f, "redis"),
        }
    }
}

// =============================================================================
// File Config Structs (JSON deserialization)
// =============================================================================

/// Server configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Message bus configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct BusFileConfig {
    pub backend: Option<BusBackend>,
    pub redis_url: Option<String>,
    pub topic: Option<String>,
    pub group: Option<String>,
    pub consumer: Option<String>,
    pub batch_size: Option<usize>,
    pub block_ms: Option<u64>,
    pub connect_attempts: Option<u32>,
    pub connect_base_delay_ms: Option<u64>,
    pub claim_interval_secs: Option<u64>,
    pub claim_min_idle_ms: Option<u64>,
}

/// Aggregation configuration section
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AggregationFileConfig {
    pub series_ttl_secs: Option<u64>,
    pub eviction_interval_secs: Option<u64>,
    pub resource_labels: Option<Vec<String>>,
}

/// File-based configuration (JSON)
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub server: Option<ServerFileConfig>,
    pub bus: Option<BusFileConfig>,
    pub aggregation: Option<AggregationFileConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

/// Overwrite `$current` with `$other` when set
macro_rules! merge_field {
    ($current:expr, $other:expr, $label:literal) => {
        if $other.is_some() {
            tracing::trace!(field = $label, value = ?$other, "Merging config field");
            $current = $other;
        }
    };
}

impl FileConfig {
    /// Load configuration from a JSON file
    fn load_from_file(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "Loading config file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        tracing::trace!(config = ?config, "Parsed config file");
        Ok(config)
    }

    /// Top-level keys not recognised as a config section
    fn unknown_fields(&self) -> Vec<String> {
        match &self.extra {
            serde_json::Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Warn about unknown fields in the config
    fn warn_unknown_fields(&self) {
        let unknown = self.unknown_fields();
        if !unknown.is_empty() {
            tracing::warn!(
                fields = %unknown.join(", "),
                "Unknown fields in config file (possible typos)"
            );
        }
    }

    /// Merge another FileConfig into this one (other takes precedence)
    fn merge(&mut self, other: FileConfig) {
        if let Some(server) = other.server {
            let current = self.server.get_or_insert_with(ServerFileConfig::default);
            merge_field!(current.host, server.host, "server.host");
            merge_field!(current.port, server.port, "server.port");
        }

        if let Some(bus) = other.bus {
            let current = self.bus.get_or_insert_with(BusFileConfig::default);
            merge_field!(current.backend, bus.backend, "bus.backend");
            merge_field!(current.redis_url, bus.redis_url, "bus.redis_url");
            merge_field!(current.topic, bus.topic, "bus.topic");
            merge_field!(current.group, bus.group, "bus.group");
            merge_field!(current.consumer, bus.consumer, "bus.consumer");
            merge_field!(current.batch_size, bus.batch_size, "bus.batch_size");
            merge_field!(current.block_ms, bus.block_ms, "bus.block_ms");
            merge_field!(
                current.connect_attempts,
                bus.connect_attempts,
                "bus.connect_attempts"
            );
            merge_field!(
                current.connect_base_delay_ms,
                bus.connect_base_delay_ms,
                "bus.connect_base_delay_ms"
            );
            merge_field!(
                current.claim_interval_secs,
                bus.claim_interval_secs,
                "bus.claim_interval_secs"
            );
            merge_field!(
                current.claim_min_idle_ms,
                bus.claim_min_idle_ms,
                "bus.claim_min_idle_ms"
            );
        }

        if let Some(aggregation) = other.aggregation {
            let current = self
                .aggregation
                .get_or_insert_with(AggregationFileConfig::default);
            merge_field!(
                current.series_ttl_secs,
                aggregation.series_ttl_secs,
                "aggregation.series_ttl_secs"
            );
            merge_field!(
                current.eviction_interval_secs,
                aggregation.eviction_interval_secs,
                "aggregation.eviction_interval_secs"
            );
            merge_field!(
                current.resource_labels,
                aggregation.resource_labels,
                "aggregation.resource_labels"
            );
        }
    }
}

// =============================================================================
// Runtime Config Structs (final merged configuration)
// =============================================================================

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Message bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub backend: BusBackend,
    pub redis_url: Option<String>,
    pub topic: String,
    pub group: String,
    /// Stable across restarts only when set explicitly
    pub consumer: String,
    pub batch_size: usize,
    pub block_ms: u64,
    pub connect_attempts: u32,
    pub connect_base_delay_ms: u64,
    pub claim_interval_secs: u64,
    pub claim_min_idle_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            redis_url: None,
            topic: DEFAULT_TOPIC.to_string(),
            group: DEFAULT_CONSUMER_GROUP.to_string(),
            consumer: default_consumer_name(),
            batch_size: DEFAULT_BATCH_SIZE,
            block_ms: DEFAULT_BLOCK_MS,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_base_delay_ms: DEFAULT_CONNECT_BASE_DELAY_MS,
            claim_interval_secs: DEFAULT_CLAIM_INTERVAL_SECS,
            claim_min_idle_ms: DEFAULT_CLAIM_MIN_IDLE_MS,
        }
    }
}

impl BusConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_secs(self.claim_interval_secs)
    }
}

/// Aggregation configuration
#[derive(Debug, Clone)]
pub struct AggregationConfig {
    /// Series idle for longer are evicted; `None` keeps them forever
    pub series_ttl_secs: Option<u64>,
    pub eviction_interval_secs: u64,
    /// Resource attribute keys promoted to series labels
    pub resource_labels: Vec<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            series_ttl_secs: None,
            eviction_interval_secs: DEFAULT_EVICTION_INTERVAL_SECS,
            resource_labels: Vec::new(),
        }
    }
}

/// Final merged application configuration
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub aggregation: AggregationConfig,
}

impl AppConfig {
    /// Load configuration from all sources
    ///
    /// Priority (lowest to highest):
    /// 1. Defaults
    /// 2. Profile directory config (~/.metrics-exporter/metrics-exporter.json)
    /// 3. Local directory config OR CLI-specified config path
    /// 4. CLI arguments (which include env var fallbacks via clap)
    pub fn load(cli: &CliConfig) -> Result<Self> {
        Self::load_from(cli, get_profile_config_path())
    }

    fn load_from(cli: &CliConfig, profile_path: Option<PathBuf>) -> Result<Self> {
        tracing::debug!("Loading application configuration");
        tracing::trace!(cli = ?cli, "CLI config");

        let mut file_config = FileConfig::default();
        let mut found_configs: Vec<String> = Vec::new();

        // 1. Profile dir - skip if not exists
        if let Some(profile_path) = profile_path
            && profile_path.exists()
        {
            let profile_config = FileConfig::load_from_file(&profile_path)?;
            profile_config.warn_unknown_fields();
            file_config.merge(profile_config);
            found_configs.push(profile_path.display().to_string());
        }

        // 2. CLI-specified path OR local directory
        let overlay_path = if let Some(ref path) = cli.config {
            let expanded = expand_home(path);
            if !expanded.exists() {
                anyhow::bail!("Config file not found: {}", expanded.display());
            }
            Some(expanded)
        } else {
            let local = PathBuf::from(CONFIG_FILE_NAME);
            if local.exists() { Some(local) } else { None }
        };

        if let Some(path) = overlay_path {
            let overlay_config = FileConfig::load_from_file(&path)?;
            overlay_config.warn_unknown_fields();
            file_config.merge(overlay_config);
            found_configs.push(path.display().to_string());
        }

        tracing::debug!(configs = ?found_configs, "Config files loaded");

        let config = Self::layer(cli, file_config);
        config.validate()?;
        Ok(config)
    }

    /// Layer configs: defaults -> file config -> CLI/env overrides
    fn layer(cli: &CliConfig, file_config: FileConfig) -> Self {
        let file_server = file_config.server.unwrap_or_default();
        let file_bus = file_config.bus.unwrap_or_default();
        let file_aggregation = file_config.aggregation.unwrap_or_default();
        let defaults = BusConfig::default();

        let server = ServerConfig {
            host: cli
                .host
                .clone()
                .or(file_server.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(file_server.port).unwrap_or(DEFAULT_PORT),
        };

        let bus = BusConfig {
            backend: cli.bus_backend.or(file_bus.backend).unwrap_or_default(),
            redis_url: cli.bus_redis_url.clone().or(file_bus.redis_url),
            topic: cli.bus_topic.clone().or(file_bus.topic).unwrap_or(defaults.topic),
            group: cli.bus_group.clone().or(file_bus.group).unwrap_or(defaults.group),
            consumer: cli
                .bus_consumer
                .clone()
                .or(file_bus.consumer)
                .unwrap_or(defaults.consumer),
            batch_size: cli
                .batch_size
                .or(file_bus.batch_size)
                .unwrap_or(defaults.batch_size),
            block_ms: file_bus.block_ms.unwrap_or(defaults.block_ms),
            connect_attempts: file_bus
                .connect_attempts
                .unwrap_or(defaults.connect_attempts),
            connect_base_delay_ms: file_bus
                .connect_base_delay_ms
                .unwrap_or(defaults.connect_base_delay_ms),
            claim_interval_secs: file_bus
                .claim_interval_secs
                .unwrap_or(defaults.claim_interval_secs),
            claim_min_idle_ms: file_bus
                .claim_min_idle_ms
                .unwrap_or(defaults.claim_min_idle_ms),
        };

        // 0 disables eviction
        let series_ttl_secs = cli
            .series_ttl_secs
            .or(file_aggregation.series_ttl_secs)
            .filter(|&ttl| ttl > 0);

        let aggregation = AggregationConfig {
            series_ttl_secs,
            eviction_interval_secs: file_aggregation
                .eviction_interval_secs
                .unwrap_or(DEFAULT_EVICTION_INTERVAL_SECS),
            resource_labels: file_aggregation.resource_labels.unwrap_or_default(),
        };

        Self {
            server,
            bus,
            aggregation,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            anyhow::bail!("Configuration error: server.host must not be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("Configuration error: server.port must be greater than 0");
        }

        if self.bus.backend == BusBackend::Redis {
            match self.bus.redis_url.as_deref() {
                None | Some("") => anyhow::bail!(
                    "Configuration error: bus.redis_url is required when bus.backend is 'redis'"
                ),
                Some(url) if !url.starts_with("redis://") && !url.starts_with("rediss://") => {
                    anyhow::bail!(
                        "Configuration error: bus.redis_url must start with redis:// or rediss://"
                    )
                }
                Some(_) => {}
            }
        }

        for (field, value) in [
            ("bus.topic", &self.bus.topic),
            ("bus.group", &self.bus.group),
            ("bus.consumer", &self.bus.consumer),
        ] {
            if value.is_empty() {
                anyhow::bail!("Configuration error: {} must not be empty", field);
            }
        }

        if self.bus.block_ms == 0 {
            anyhow::bail!("Configuration error: bus.block_ms must be greater than 0");
        }
        if self.bus.batch_size == 0 {
            anyhow::bail!("Configuration error: bus.batch_size must be greater than 0");
        }
        if self.bus.connect_attempts == 0 {
            anyhow::bail!("Configuration error: bus.connect_attempts must be greater than 0");
        }
        if self.bus.claim_interval_secs == 0 {
            anyhow::bail!("Configuration error: bus.claim_interval_secs must be greater than 0");
        }
        if self.aggregation.series_ttl_secs.is_some() && self.aggregation.eviction_interval_secs == 0
        {
            anyhow::bail!(
                "Configuration error: aggregation.eviction_interval_secs must be greater than 0"
            );
        }
        if self.aggregation.resource_labels.iter().any(|l| l.is_empty()) {
            anyhow::bail!("Configuration error: aggregation.resource_labels must not contain empty keys");
        }

        Ok(())
    }
}

/// `{uuid}:{pid}`, unique per process
fn default_consumer_name() -> String {
    format!("{}:{}", uuid::Uuid::new_v4(), std::process::id())
}

/// Get the profile config path (~/.metrics-exporter/metrics-exporter.json)
fn get_profile_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(APP_DOT_FOLDER).join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
