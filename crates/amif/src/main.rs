//! # amif-node - AMIF module host
//!
//! Runs one module per process: joins the gossip cluster, connects the
//! broker, hosts the built-in monitor module and serves the admin API.
//!
//! ## Architecture
//! ```text
//! peers ⇄ UDP gossip ⇄ DiscoveryService ─┐
//!                                         ├─ MonitorModule
//! Redis ⇄ Broker ────────────────────────┘
//!   ↑
//! admin HTTP (/health /ready /members /metrics)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use amif::broker::Broker;
use amif::config::{AppConfig, ConfigOverrides};
use amif::discovery::{Clock, DiscoveryService, GossipTransport, SystemClock, UdpTransport};
use amif::module::{ModuleContext, MonitorModule};
use amif::node::{self, NodeState};
use amif::routes;
use amif::storage::{MemoryBackend, RedisBackend, StorageBackend};
use amif_common::ModuleRecord;

/// AMIF node - gossip membership + topic broker
#[derive(Parser, Debug)]
#[command(name = "amif-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/amif.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Module name, unique in the cluster (overrides config)
    #[arg(short, long, env = "AMIF_MODULE_NAME")]
    name: Option<String>,

    /// Gossip bind address (overrides config)
    #[arg(long, env = "AMIF_GOSSIP_BIND")]
    gossip_bind: Option<String>,

    /// Gossip address announced to peers (overrides config)
    #[arg(long, env = "AMIF_ADVERTISE")]
    advertise: Option<String>,

    /// Seed peer address; repeat or comma-separate for several
    #[arg(long = "seed", env = "AMIF_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// Admin API listen address (overrides config)
    #[arg(short, long, env = "ADMIN_ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    /// Use the in-process backend instead of Redis (single node only)
    #[arg(long, default_value = "false")]
    in_memory: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            redis_url: self.redis_url.clone(),
            module_name: self.name.clone(),
            gossip_bind: self.gossip_bind.clone(),
            advertise_addr: self.advertise.clone(),
            seeds: self.seeds.clone(),
            admin_addr: self.listen.clone(),
            in_memory: self.in_memory,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🔌 Starting AMIF node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args.overrides())?;
    info!(module = %config.module.name, "📋 Configuration loaded from {}", args.config);

    // Storage backend + broker
    let backend: Arc<dyn StorageBackend> = if config.in_memory {
        warn!("Using in-memory backend; broker traffic stays inside this process");
        Arc::new(MemoryBackend::new())
    } else {
        let redis = RedisBackend::connect(&config.redis_url).await?;
        info!("✅ Redis connected: {}", config.redis_url);
        Arc::new(redis)
    };
    let broker = Broker::new(backend);

    let incarnation = node::next_incarnation(&broker, &config.module.name).await;

    // Gossip
    let transport = Arc::new(
        UdpTransport::bind(&config.gossip.bind_addr, config.gossip.advertise_addr.clone()).await?,
    );
    if config.gossip.advertise_addr.is_none() && config.gossip.bind_addr.starts_with("0.0.0.0") {
        warn!(
            bind = %config.gossip.bind_addr,
            "Gossip bound to a wildcard address without --advertise; peers cannot dial back"
        );
    }

    let discovery = Arc::new(DiscoveryService::new(config.gossip.clone(), transport.clone()));
    node::forward_membership_events(&discovery, broker.clone());

    let self_record = ModuleRecord::alive(
        config.module.name.clone(),
        transport.local_address(),
        incarnation,
        SystemClock.now_millis(),
    );
    discovery
        .start(self_record)
        .await
        .context("Failed to start discovery")?;

    // Built-in module
    let ctx = ModuleContext::new(config.module.clone(), broker.clone(), discovery.clone());
    let monitor = Arc::new(MonitorModule::new(ctx.clone()));

    let mut subscriptions = Vec::with_capacity(config.topics.len());
    for topic in &config.topics {
        let subscription = ctx
            .attach(monitor.clone(), topic)
            .await
            .with_context(|| format!("Failed to subscribe to {}", topic))?;
        subscriptions.push(subscription);
    }

    ctx.mark_operational()?;
    info!("{}", ctx);

    // Admin API
    let admin_addr = config.admin_addr.clone();
    let app = routes::create_router(NodeState::new(config, broker, discovery.clone()));

    let listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {}", admin_addr))?;
    info!("🚀 Admin API listening on {}", admin_addr);

    // Handle graceful shutdown
    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("🛑 Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    discovery.stop();
    for subscription in &subscriptions {
        subscription.cancel();
    }

    info!(handled = monitor.seen(), "👋 AMIF node shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
