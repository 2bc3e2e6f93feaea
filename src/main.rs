use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{
    MemoryStorage, RateLimitConfig, RateLimitRequest, RateLimiter, SystemClock,
};

/// Token bucket rate limiter tooling.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate a configuration file
    CheckConfig {
        /// Path to the YAML configuration
        path: PathBuf,
    },

    /// Drive an in-memory limiter and print each verdict as a JSON line
    Simulate {
        /// Path to the YAML configuration; a 10 per 60s policy is used otherwise
        #[arg(long)]
        config: Option<PathBuf>,

        /// Identifier to limit
        #[arg(long)]
        identifier: String,

        /// Namespace for the identifier's bucket
        #[arg(long)]
        namespace: Option<String>,

        /// Number of requests to send
        #[arg(long, default_value_t = 20)]
        requests: u32,

        /// Tokens charged per request
        #[arg(long, default_value_t = 1)]
        cost: u32,

        /// Delay between requests in milliseconds
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CheckConfig { path } => {
            init_tracing(&LoggingConfig::default());

            let config = TollgateConfig::load(&path)?;
            println!(
                "{}: ok (points={} duration={}s block_duration={} bypass={})",
                path.display(),
                config.limiter.points,
                config.limiter.duration,
                config
                    .limiter
                    .block_duration
                    .map(|secs| format!("{}s", secs))
                    .unwrap_or_else(|| "none".to_string()),
                config.bypass.len(),
            );
        }
        Command::Simulate {
            config,
            identifier,
            namespace,
            requests,
            cost,
            interval_ms,
        } => {
            let config = match config {
                Some(path) => TollgateConfig::load(path)?,
                None => default_config()?,
            };
            init_tracing(&config.logging);

            simulate(config, identifier, namespace, requests, cost, interval_ms).await?;
        }
    }

    Ok(())
}

fn default_config() -> anyhow::Result<TollgateConfig> {
    Ok(TollgateConfig {
        limiter: RateLimitConfig::new(10, 60)?,
        storage: Default::default(),
        bypass: Vec::new(),
        logging: Default::default(),
    })
}

/// Initialize tracing on stderr, keeping stdout for command output.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn simulate(
    config: TollgateConfig,
    identifier: String,
    namespace: Option<String>,
    requests: u32,
    cost: u32,
    interval_ms: u64,
) -> anyhow::Result<()> {
    let clock = Arc::new(SystemClock::new());
    let storage = Arc::new(MemoryStorage::with_sweep_interval(
        clock.clone(),
        config.storage.sweep_interval(),
    ));

    let limiter = RateLimiter::builder(config.limiter)
        .storage(storage)
        .clock(clock)
        .bypass(&config.bypass)
        .on_error(|e| warn!(error = %e, "Limiter reported an error"))
        .build()?;

    let mut request = RateLimitRequest::new(identifier).cost(cost);
    if let Some(namespace) = namespace {
        request = request.namespace(namespace);
    }

    info!(
        identifier = %request.identifier,
        requests = requests,
        cost = cost,
        "Starting simulation"
    );

    let run = async {
        let mut allowed = 0u32;
        for i in 0..requests {
            if i > 0 {
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }

            let result = limiter.consume(&request).await;
            if result.allowed {
                allowed += 1;
            }
            println!("{}", serde_json::to_string(&result)?);
        }
        Ok::<u32, anyhow::Error>(allowed)
    };

    tokio::select! {
        outcome = run => {
            let allowed = outcome?;
            info!(allowed = allowed, rejected = requests - allowed, "Simulation complete");
        }
        _ = shutdown_signal() => {}
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}
