use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::options::{StaticOptionsProvider, StoreOptionsProvider};
use gatekeeper::ratelimit::{
    AlgorithmBackend, DefaultAlgorithmFactory, DistributedRateLimiter, RequestInfo,
};
use gatekeeper::store::{AtomicStore, MemoryStore, RedisStore};
use gatekeeper::sync::PolicySyncWorker;

#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about = "Distributed rate limiting engine")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Keep the engine and its policy refresher running
    Run,
    /// Copy the upstream policy document into the shared store
    Sync,
    /// Drive the engine with synthetic requests and print a summary
    Simulate {
        /// Number of requests to send
        #[arg(long, default_value_t = 1000)]
        requests: usize,
        /// Number of distinct clients
        #[arg(long, default_value_t = 10)]
        clients: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatekeeperConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    info!(
        backend = ?config.engine.algorithm_backend,
        redis = config.redis.url.is_some(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Run => run(config).await,
        Command::Sync => sync(config).await,
        Command::Simulate { requests, clients } => simulate(config, requests, clients).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_redis(config: &GatekeeperConfig) -> anyhow::Result<Arc<RedisStore>> {
    let Some(url) = config.redis.url.as_deref() else {
        bail!("redis.url is required (set GATEKEEPER__REDIS__URL)");
    };
    let store = RedisStore::connect(url)
        .await
        .context("failed to connect to Redis")?
        .with_timeout(config.engine.backend_timeout());
    Ok(Arc::new(store))
}

fn algorithm_factory(
    config: &GatekeeperConfig,
    store: Arc<dyn AtomicStore>,
) -> DefaultAlgorithmFactory {
    match config.engine.algorithm_backend {
        AlgorithmBackend::Local => DefaultAlgorithmFactory::local(),
        AlgorithmBackend::Shared => DefaultAlgorithmFactory::shared(store),
    }
}

async fn run(config: GatekeeperConfig) -> anyhow::Result<()> {
    let store: Arc<dyn AtomicStore> = connect_redis(&config).await?;
    let initial = config.policy.load().context("invalid initial policy")?;

    let provider = Arc::new(StoreOptionsProvider::new(
        store.clone(),
        config.redis.options_key.clone(),
        initial,
        config.refresh.poll_interval(),
    )?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = provider.clone().spawn_refresher(shutdown_rx);

    let limiter = DistributedRateLimiter::new(
        provider,
        Arc::new(algorithm_factory(&config, store)),
        config.engine.engine_options(),
    )?;
    info!(nodes = ?limiter.node_ids(), "Rate limiter ready");

    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    refresher.await.context("policy refresher panicked")?;

    info!("Gatekeeper stopped");
    Ok(())
}

async fn sync(config: GatekeeperConfig) -> anyhow::Result<()> {
    let store: Arc<dyn AtomicStore> = connect_redis(&config).await?;
    let worker = Arc::new(PolicySyncWorker::new(
        config.sync.clone(),
        store,
        config.redis.options_key.clone(),
        config.redis.update_channel.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_rx).await }
    });

    shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    handle.await.context("policy sync worker panicked")?;

    info!("Gatekeeper sync stopped");
    Ok(())
}

#[derive(Debug, Default)]
struct Tally {
    allowed: usize,
    denied: usize,
}

async fn simulate(config: GatekeeperConfig, requests: usize, clients: usize) -> anyhow::Result<()> {
    if clients == 0 {
        bail!("--clients must be at least 1");
    }

    let store: Arc<dyn AtomicStore> = if config.redis.url.is_some() {
        connect_redis(&config).await?
    } else {
        Arc::new(MemoryStore::new())
    };
    let provider = Arc::new(StaticOptionsProvider::new(
        config.policy.load().context("invalid policy")?,
    )?);
    let limiter = DistributedRateLimiter::new(
        provider,
        Arc::new(algorithm_factory(&config, store)),
        config.engine.engine_options(),
    )?;

    let mut per_node: BTreeMap<String, Tally> = BTreeMap::new();
    let mut denied_by: BTreeMap<String, usize> = BTreeMap::new();
    for i in 0..requests {
        let request = RequestInfo::new().with_user_id(format!("client-{}", i % clients));
        let decision = limiter
            .should_allow_with_policy(&request, config.engine.failure_policy)
            .await;

        let tally = per_node.entry(decision.node_id.clone()).or_default();
        if decision.allowed {
            tally.allowed += 1;
        } else {
            tally.denied += 1;
            *denied_by.entry(decision.algorithm).or_default() += 1;
        }
    }

    let allowed: usize = per_node.values().map(|t| t.allowed).sum();
    println!("requests: {}  clients: {}", requests, clients);
    println!("allowed:  {}  denied: {}", allowed, requests - allowed);
    for (node, tally) in &per_node {
        println!("  {:<10} allowed {:>6}  denied {:>6}", node, tally.allowed, tally.denied);
    }
    for (algorithm, count) in &denied_by {
        let name = if algorithm.is_empty() { "(backend)" } else { algorithm.as_str() };
        println!("  denied by {:<16} {:>6}", name, count);
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
