//! Fanlink Daemon - Main entry point
//!
//! Bridges vendor appliances to the device-management broker: keeps the
//! device registry in step with the vendor cloud, runs one session per
//! device and routes upstream commands to those sessions.

mod config;
mod router;
mod upstream;

use anyhow::{Context, Result};
use clap::Parser;
use fanlink_cloud::CloudClient;
use fanlink_core::{DeviceRegistry, ModelCatalog};
use fanlink_discovery::{presence, DiscoveryEngine};
use fanlink_session::MqttSessionFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "fanlink")]
#[command(about = "Vendor appliance gateway for the device-management bus")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "fanlink.toml")]
    config: PathBuf,

    /// Upstream broker as host[:port]
    #[arg(short, long)]
    broker: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single presence scan and exit
    #[arg(long)]
    presence_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Fanlink v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    if let Some(broker) = &args.broker {
        config.apply_broker_override(broker)?;
    }

    info!(
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        client_id = %config.broker.client_id,
        "Configuration loaded"
    );

    if args.presence_once {
        info!("Running single presence scan");
        let hits = presence::scan(&config.presence_config()).await?;
        println!("Found {} hosts:", hits.len());
        let mut hits: Vec<_> = hits.into_iter().collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        for (hostname, hit) in hits {
            println!("  - {} at {}:{}", hostname, hit.ip, hit.port);
        }
        return Ok(());
    }

    if let Some(delay) = config.start_delay.pick() {
        info!(delay_secs = delay.as_secs(), "Delaying start");
        tokio::time::sleep(delay).await;
    }

    let registry = DeviceRegistry::open(&config.discovery.db_path)
        .with_context(|| format!("opening registry in {}", config.discovery.db_path.display()))?;
    let cloud = Arc::new(CloudClient::new(config.cloud_config())?);
    let catalog = ModelCatalog::builtin().with_device_types(config.device_types.clone());
    for model in catalog.model_ids() {
        info!(model = %model, device_type = ?catalog.device_type(&model), "Supported model");
    }

    let (upstream, eventloop) = upstream::MqttUpstream::new(&config.broker);
    let upstream = Arc::new(upstream);
    let sessions = Arc::new(MqttSessionFactory::new(
        upstream.clone(),
        config.session_config(),
        config.discovery.device_id_prefix.clone(),
    ));

    let engine = Arc::new(DiscoveryEngine::new(
        config.engine_config(),
        registry,
        cloud,
        upstream.clone(),
        catalog,
        sessions,
    ));
    let router = Arc::new(router::CommandRouter::new(engine.pool()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let discovery = tokio::spawn(engine.clone().run(shutdown_rx.clone()));
    let presence = tokio::spawn(engine.clone().run_presence(shutdown_rx.clone()));
    let bus = tokio::spawn(upstream::run(
        eventloop,
        upstream,
        router,
        engine,
        shutdown_rx,
    ));

    wait_for_signal().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    for (name, task) in [("discovery", discovery), ("presence", presence), ("upstream", bus)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
