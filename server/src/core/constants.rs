// =============================================================================
// Application Identity
// =============================================================================

/// Application name in lowercase (for paths, identifiers and metric prefixes)
pub const APP_NAME_LOWER: &str = "metrics-exporter";

/// Unix-style dotfile folder name
pub const APP_DOT_FOLDER: &str = ".metrics-exporter";

/// Prefix for self-reported pipeline metrics
pub const SELF_METRICS_PREFIX: &str = "metrics_exporter";

// =============================================================================
// Configuration Files
// =============================================================================

/// Config file name
pub const CONFIG_FILE_NAME: &str = "metrics-exporter.json";

/// Environment variable for config file path
pub const ENV_CONFIG: &str = "METRICS_EXPORTER_CONFIG";

// =============================================================================
// Environment Variables - Server
// =============================================================================

/// Environment variable for scrape listen host
pub const ENV_HOST: &str = "METRICS_EXPORTER_HOST";

/// Environment variable for scrape listen port
pub const ENV_PORT: &str = "METRICS_EXPORTER_PORT";

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "METRICS_EXPORTER_LOG";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default scrape listen host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default scrape listen port (Prometheus exporter convention for OTLP metrics)
pub const DEFAULT_PORT: u16 = 9464;

// =============================================================================
// Environment Variables - Message Bus
// =============================================================================

/// Environment variable for the bus backend (memory or redis)
pub const ENV_BUS_BACKEND: &str = "METRICS_EXPORTER_BUS_BACKEND";

/// Environment variable for the Redis URL
pub const ENV_BUS_REDIS_URL: &str = "METRICS_EXPORTER_BUS_REDIS_URL";

/// Environment variable for the metrics topic name
pub const ENV_BUS_TOPIC: &str = "METRICS_EXPORTER_BUS_TOPIC";

/// Environment variable for the consumer group name
pub const ENV_BUS_GROUP: &str = "METRICS_EXPORTER_BUS_GROUP";

/// Environment variable for the consumer name within the group
pub const ENV_BUS_CONSUMER: &str = "METRICS_EXPORTER_BUS_CONSUMER";

/// Environment variable for the maximum batch size per pull
pub const ENV_BUS_BATCH_SIZE: &str = "METRICS_EXPORTER_BUS_BATCH_SIZE";

// =============================================================================
// Message Bus Defaults
// =============================================================================

/// Default metrics topic name
pub const DEFAULT_TOPIC: &str = "otlp_metrics";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "metrics_exporter";

/// Default maximum messages per batch
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Default time a pull blocks waiting for messages (milliseconds)
pub const DEFAULT_BLOCK_MS: u64 = 1_000;

/// Default attempts to establish the bus subscription at startup
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Default base delay for connection backoff (milliseconds)
pub const DEFAULT_CONNECT_BASE_DELAY_MS: u64 = 200;

/// Default interval for claiming stuck messages (seconds)
pub const DEFAULT_CLAIM_INTERVAL_SECS: u64 = 30;

/// Default idle time before a pending message may be claimed (milliseconds)
pub const DEFAULT_CLAIM_MIN_IDLE_MS: u64 = 60_000;

/// Maximum number of messages claimed at once
pub const CLAIM_MAX_COUNT: usize = 100;

/// Delay after a transient bus read error before the next pull (milliseconds)
pub const READ_ERROR_BACKOFF_MS: u64 = 500;

// =============================================================================
// Environment Variables - Aggregation
// =============================================================================

/// Environment variable for series staleness TTL (seconds)
pub const ENV_SERIES_TTL_SECS: &str = "METRICS_EXPORTER_SERIES_TTL_SECS";

// =============================================================================
// Aggregation Defaults
// =============================================================================

/// Default interval between staleness sweeps (seconds)
pub const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Shutdown
// =============================================================================

/// Timeout for background tasks during graceful shutdown (seconds)
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
