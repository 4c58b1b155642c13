//! Pipeline coordinator
//!
//! Owns the lifecycle `Stopped -> Starting -> Running -> Draining -> Stopped`:
//! connect to the bus and join the consumer group (with retry), bind the
//! listener, run the consumer loop and exposition server side by side, and on
//! shutdown drain the consumer before the server stops accepting scrapes.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::{AppConfig, BusConfig};
use super::shutdown::ShutdownService;
use crate::api::{ExpositionServer, ExpositionState};
use crate::data::topics::{StreamTopicSubscriber, TopicError, TopicService};
use crate::domain::metrics::{
    Aggregator, ConsumerLoop, ConsumerSettings, DecodeOptions, PipelineStats,
};
use crate::utils::retry::retry_with_backoff_async;
use crate::utils::time::now_unix_nanos;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Lifecycle state, observable through `Pipeline::state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Draining,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Stopped => write!(f, "stopped"),
            PipelineState::Starting => write!(f, "starting"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Draining => write!(f, "draining"),
        }
    }
}

/// Fatal pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("message bus unreachable after {attempts} attempts: {source}")]
    BusConnection {
        attempts: u32,
        #[source]
        source: TopicError,
    },
    #[error("failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("exposition server failed: {0}")]
    Server(#[source] io::Error),
}

/// Wires the bus, aggregator and exposition server together
pub struct Pipeline {
    config: AppConfig,
    topics: Option<TopicService>,
    aggregator: Arc<Aggregator>,
    stats: Arc<PipelineStats>,
    state_tx: watch::Sender<PipelineState>,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Stopped);
        Self {
            config,
            topics: None,
            aggregator: Arc::new(Aggregator::new()),
            stats: Arc::new(PipelineStats::new()),
            state_tx,
        }
    }

    /// Use an already connected bus instead of connecting from config
    pub fn with_topics(mut self, topics: TopicService) -> Self {
        self.topics = Some(topics);
        self
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        Arc::clone(&self.aggregator)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    /// Start all tasks; returns once the pipeline is running
    ///
    /// On error the pipeline is back in `Stopped` and nothing is left running.
    pub async fn start(mut self, shutdown: ShutdownService) -> Result<RunningPipeline, PipelineError> {
        self.state_tx.send_replace(PipelineState::Starting);
        tracing::debug!("Pipeline starting");

        let (subscriber, bus_backend) = match self.join_bus().await {
            Ok(joined) => joined,
            Err(e) => {
                self.state_tx.send_replace(PipelineState::Stopped);
                return Err(e);
            }
        };

        let (server, local_addr) = match self.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                self.state_tx.send_replace(PipelineState::Stopped);
                return Err(e);
            }
        };

        let bus = &self.config.bus;
        let settings = ConsumerSettings {
            batch_size: bus.batch_size,
            block: bus.block(),
            claim_interval: bus.claim_interval(),
            claim_min_idle_ms: bus.claim_min_idle_ms,
            ..ConsumerSettings::default()
        };
        let decode_options = DecodeOptions {
            resource_labels: self.config.aggregation.resource_labels.clone(),
        };
        let consumer = ConsumerLoop::new(
            Arc::clone(&self.aggregator),
            Arc::clone(&self.stats),
            decode_options,
            settings,
        )
        .start(subscriber, shutdown.subscribe());
        shutdown.register(consumer).await;

        if let Some(ttl_secs) = self.config.aggregation.series_ttl_secs {
            let every = Duration::from_secs(self.config.aggregation.eviction_interval_secs);
            tracing::debug!(ttl_secs, every_secs = every.as_secs(), "Series eviction enabled");
            let eviction = spawn_eviction(
                Arc::clone(&self.aggregator),
                Arc::clone(&self.stats),
                ttl_secs.saturating_mul(NANOS_PER_SEC),
                every,
                shutdown.subscribe(),
            );
            shutdown.register(eviction).await;
        }

        let (server_stop, mut server_stop_rx) = watch::channel(false);
        let state = ExpositionState {
            aggregator: Arc::clone(&self.aggregator),
            stats: Arc::clone(&self.stats),
            pipeline_state: self.state_tx.subscribe(),
            bus_backend,
        };
        let server = tokio::spawn(server.serve(state, async move {
            let _ = server_stop_rx.wait_for(|&v| v).await;
        }));

        self.state_tx.send_replace(PipelineState::Running);
        tracing::info!(
            addr = %local_addr,
            bus = bus_backend,
            topic = %self.config.bus.topic,
            "Metrics exporter running"
        );

        Ok(RunningPipeline {
            local_addr,
            shutdown,
            state_tx: self.state_tx,
            server,
            server_stop,
        })
    }

    /// Connect and subscribe, retrying with exponential backoff
    async fn join_bus(&mut self) -> Result<(StreamTopicSubscriber, &'static str), PipelineError> {
        let bus = &self.config.bus;
        let mut attempts = 0;

        let topics = match self.topics.take() {
            Some(topics) => topics,
            None => {
                if bus.backend.is_process_local() {
                    tracing::warn!(
                        "Using the in-memory bus: no external producer can publish to it, set bus.backend to 'redis' to consume real traffic"
                    );
                }
                let (topics, used) = connect_with_retry(bus).await?;
                attempts += used;
                topics
            }
        };

        let topic = topics.stream_topic(&bus.topic);
        let (subscriber, used) = retry_with_backoff_async(
            bus.connect_attempts,
            bus.connect_base_delay_ms,
            || topic.subscribe(&bus.group, &bus.consumer),
        )
        .await
        .map_err(|(source, used)| PipelineError::BusConnection {
            attempts: attempts + used,
            source,
        })?;

        tracing::debug!(
            bus = topics.backend_name(),
            topic = %bus.topic,
            group = %bus.group,
            consumer = %bus.consumer,
            attempts = attempts + used,
            "Joined consumer group"
        );
        Ok((subscriber, topics.backend_name()))
    }

    async fn bind(&self) -> Result<(ExpositionServer, SocketAddr), PipelineError> {
        let host = &self.config.server.host;
        let port = self.config.server.port;
        let bind_error = |source| PipelineError::ListenerBind {
            addr: format!("{host}:{port}"),
            source,
        };

        let server = ExpositionServer::bind(host, port).await.map_err(bind_error)?;
        let local_addr = server.local_addr().map_err(bind_error)?;
        Ok((server, local_addr))
    }
}

async fn connect_with_retry(bus: &BusConfig) -> Result<(TopicService, u32), PipelineError> {
    retry_with_backoff_async(bus.connect_attempts, bus.connect_base_delay_ms, || {
        TopicService::connect(bus)
    })
    .await
    .map_err(|(source, attempts)| PipelineError::BusConnection { attempts, source })
}

/// Periodically drop series idle for longer than `max_age_nanos`
fn spawn_eviction(
    aggregator: Arc<Aggregator>,
    stats: Arc<PipelineStats>,
    max_age_nanos: u64,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    let evicted = aggregator.evict_stale(now_unix_nanos(), max_age_nanos);
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted stale series");
                        stats.record_evicted(evicted);
                    }
                }
            }
        }
        tracing::debug!("Eviction task stopped");
    })
}

/// Handle to a started pipeline
pub struct RunningPipeline {
    local_addr: SocketAddr,
    shutdown: ShutdownService,
    state_tx: watch::Sender<PipelineState>,
    server: JoinHandle<io::Result<()>>,
    server_stop: watch::Sender<bool>,
}

impl RunningPipeline {
    /// Address the exposition server listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run until shutdown is signalled, then drain
    ///
    /// The consumer finishes its in-flight batch (apply and commit) before
    /// the server is told to stop, so the last scrape sees the drained state.
    pub async fn wait(mut self) -> Result<(), PipelineError> {
        let early_exit = tokio::select! {
            _ = self.shutdown.wait() => None,
            result = &mut self.server => Some(result),
        };
        if early_exit.is_some() {
            tracing::error!("Exposition server exited unexpectedly");
        }

        self.state_tx.send_replace(PipelineState::Draining);
        tracing::info!("Draining pipeline...");
        self.shutdown.drain().await;

        self.server_stop.send_replace(true);
        let result = match early_exit {
            Some(result) => result,
            None => self.server.await,
        };

        self.state_tx.send_replace(PipelineState::Stopped);
        tracing::info!("Pipeline stopped");

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PipelineError::Server(e)),
            Err(e) => Err(PipelineError::Server(io::Error::other(e))),
        }
    }
}
