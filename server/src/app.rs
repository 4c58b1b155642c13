//! Core application

use anyhow::{Context, Result};

use crate::core::cli;
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::pipeline::Pipeline;
use crate::core::shutdown::ShutdownService;

pub struct CoreApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
}

impl CoreApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let cli_config = cli::parse();
        let config = AppConfig::load(&cli_config).context("Failed to load configuration")?;
        let app = Self {
            shutdown: ShutdownService::new(),
            config,
        };
        app.start().await
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER.replace('-', "_"));

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start(self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        self.shutdown.install_signal_handlers();

        tracing::debug!(
            bus = %self.config.bus.backend,
            topic = %self.config.bus.topic,
            group = %self.config.bus.group,
            consumer = %self.config.bus.consumer,
            "Starting pipeline"
        );

        let running = Pipeline::new(self.config)
            .start(self.shutdown.clone())
            .await
            .context("Failed to start metrics pipeline")?;

        running.wait().await.context("Metrics pipeline failed")?;
        Ok(())
    }
}
