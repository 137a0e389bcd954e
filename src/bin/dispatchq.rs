//! dispatchq CLI: operator interface for exercising the dispatcher.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dispatchq::config::Config;
use dispatchq::queue::WorkQueue;
use dispatchq::telemetry::{TelemetryConfig, init_telemetry};
use dispatchq::tracker::StatusTracker;
use dispatchq::{CallError, WorkItem};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "dispatchq", about = "Rate-limited concurrent request dispatcher")]
struct Cli {
    /// TOML config file; environment variables are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a burst of synthetic calls against a simulated endpoint
    Simulate {
        /// Number of calls to enqueue
        #[arg(long, default_value_t = 50)]
        items: usize,
        /// Smallest estimated token cost per call
        #[arg(long, default_value_t = 100)]
        min_tokens: u64,
        /// Largest estimated token cost per call
        #[arg(long, default_value_t = 2_000)]
        max_tokens: u64,
        /// Mean simulated latency per attempt
        #[arg(long, default_value_t = 200)]
        latency_ms: u64,
        /// Probability an attempt is rate limited
        #[arg(long, default_value_t = 0.05)]
        rate_limited: f64,
        /// Probability an attempt hits a transient API error
        #[arg(long, default_value_t = 0.1)]
        transient: f64,
        /// Probability an attempt fails permanently
        #[arg(long, default_value_t = 0.02)]
        fatal: f64,
        /// Override requests per minute
        #[arg(long)]
        rpm: Option<u64>,
        /// Override tokens per minute
        #[arg(long)]
        tpm: Option<u64>,
        /// Override concurrency capacity
        #[arg(long)]
        capacity: Option<usize>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Simulate {
            items,
            min_tokens,
            max_tokens,
            latency_ms,
            rate_limited,
            transient,
            fatal,
            rpm,
            tpm,
            capacity,
        } => {
            let mut config = config;
            if let Some(rpm) = rpm {
                config.limits.max_requests = rpm;
            }
            if let Some(tpm) = tpm {
                config.limits.max_tokens = tpm;
            }
            if let Some(capacity) = capacity {
                config.queue.capacity = capacity;
            }
            config.validate()?;

            let mix = FailureMix {
                rate_limited,
                transient,
                fatal,
            };
            cmd_simulate(config, items, min_tokens..=max_tokens.max(min_tokens), latency_ms, mix)
                .await
        }
    }
}

#[derive(Clone, Copy)]
struct FailureMix {
    rate_limited: f64,
    transient: f64,
    fatal: f64,
}

/// A call against an in-process fake endpoint.
struct SimulatedCall {
    tokens: u64,
    latency: Duration,
    mix: FailureMix,
}

#[async_trait]
impl WorkItem for SimulatedCall {
    type Output = u64;

    async fn perform(&self) -> Result<u64, CallError> {
        tokio::time::sleep(self.latency).await;

        let roll: f64 = rand::random();
        let FailureMix {
            rate_limited,
            transient,
            fatal,
        } = self.mix;
        if roll < rate_limited {
            Err(CallError::classify(Some(429), "Rate limit reached"))
        } else if roll < rate_limited + transient {
            Err(CallError::classify(Some(503), "upstream unavailable"))
        } else if roll < rate_limited + transient + fatal {
            Err(CallError::classify(Some(400), "malformed request"))
        } else {
            Ok(self.tokens)
        }
    }

    fn estimated_tokens(&self) -> u64 {
        self.tokens
    }
}

async fn cmd_simulate(
    config: Config,
    items: usize,
    tokens: std::ops::RangeInclusive<u64>,
    latency_ms: u64,
    mix: FailureMix,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "dispatchq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let tracker = Arc::new(StatusTracker::new());
    let queue: WorkQueue<u64> = WorkQueue::from_config(&config, Arc::clone(&tracker));

    let mut handles = Vec::with_capacity(items);
    {
        let mut rng = rand::thread_rng();
        for _ in 0..items {
            let latency = rng.gen_range(latency_ms / 2..=latency_ms.saturating_mul(3) / 2);
            handles.push(queue.enqueue(SimulatedCall {
                tokens: rng.gen_range(tokens.clone()),
                latency: Duration::from_millis(latency),
                mix,
            })?);
        }
    }
    info!(items, "enqueued simulated calls");

    let q = queue.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        q.stop();
    });

    let driver = {
        let q = queue.clone();
        tokio::spawn(async move { q.process().await })
    };

    let mut tokens_used = 0;
    let mut failures = 0;
    for handle in handles {
        match handle.await {
            Ok(tokens) => tokens_used += tokens,
            Err(_) => failures += 1,
        }
    }
    driver.await??;

    let summary = serde_json::json!({
        "status": tracker.snapshot(),
        "queue": queue.stats(),
        "limiter": queue.limiter().snapshot(),
        "tokens_used": tokens_used,
        "items_failed": failures,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
