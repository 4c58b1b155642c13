use clap::Parser;

use std::path::PathBuf;

use super::config::BusBackend;
use super::constants::{
    ENV_BUS_BACKEND, ENV_BUS_BATCH_SIZE, ENV_BUS_CONSUMER, ENV_BUS_GROUP, ENV_BUS_REDIS_URL,
    ENV_BUS_TOPIC, ENV_CONFIG, ENV_HOST, ENV_PORT, ENV_SERIES_TTL_SECS,
};

#[derive(Parser)]
#[command(name = "metrics-exporter")]
#[command(
    version,
    about = "Aggregates OTLP metrics from a message bus and serves them for scraping",
    long_about = None
)]
pub struct Cli {
    /// Server host address
    #[arg(long, short = 'H', env = ENV_HOST)]
    pub host: Option<String>,

    /// Server port
    #[arg(long, short = 'p', env = ENV_PORT)]
    pub port: Option<u16>,

    /// Path to config file
    #[arg(long, short = 'c', env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Message bus backend (memory or redis)
    #[arg(long, env = ENV_BUS_BACKEND, value_parser = parse_bus_backend)]
    pub bus_backend: Option<BusBackend>,

    /// Redis URL for the redis bus backend (redis://host:port/db)
    #[arg(long, env = ENV_BUS_REDIS_URL)]
    pub bus_redis_url: Option<String>,

    /// Stream topic carrying OTLP metrics
    #[arg(long, env = ENV_BUS_TOPIC)]
    pub bus_topic: Option<String>,

    /// Consumer group name
    #[arg(long, env = ENV_BUS_GROUP)]
    pub bus_group: Option<String>,

    /// Consumer name within the group (defaults to a unique name per process)
    #[arg(long, env = ENV_BUS_CONSUMER)]
    pub bus_consumer: Option<String>,

    /// Maximum messages pulled per batch
    #[arg(long, env = ENV_BUS_BATCH_SIZE)]
    pub batch_size: Option<usize>,

    /// Drop series not updated for this many seconds (0 = never)
    #[arg(long, env = ENV_SERIES_TTL_SECS)]
    pub series_ttl_secs: Option<u64>,
}

/// Parse bus backend from CLI/env string
fn parse_bus_backend(s: &str) -> Result<BusBackend, String> {
    match s.to_lowercase().as_str() {
        "memory" => Ok(BusBackend::Memory),
        "redis" => Ok(BusBackend::Redis),
        _ => Err(format!(
            "Invalid bus backend '{}'. Valid options: memory, redis",
            s
        )),
    }
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub config: Option<PathBuf>,
    pub bus_backend: Option<BusBackend>,
    pub bus_redis_url: Option<String>,
    pub bus_topic: Option<String>,
    pub bus_group: Option<String>,
    pub bus_consumer: Option<String>,
    pub batch_size: Option<usize>,
    pub series_ttl_secs: Option<u64>,
}

impl From<Cli> for CliConfig {
    fn from(cli: Cli) -> Self {
        Self {
            host: cli.host,
            port: cli.port,
            config: cli.config,
            bus_backend: cli.bus_backend,
            bus_redis_url: cli.bus_redis_url,
            bus_topic: cli.bus_topic,
            bus_group: cli.bus_group,
            bus_consumer: cli.bus_consumer,
            batch_size: cli.batch_size,
            series_ttl_secs: cli.series_ttl_secs,
        }
    }
}

/// Parse CLI arguments
pub fn parse() -> CliConfig {
    Cli::parse().into()
}
