//! vmsched local scheduler
//!
//! Runs on one host: explores (or loads) the NUMA topology, serves the
//! deploy/remove/info command API, and reconciles subset oversubscription
//! on a fixed tick.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmsched_local::{
    api::{self, ApiState},
    config::{Args, Config, HypervisorKind},
    endpoint::{
        CsvEndpoint, Endpoint, EndpointPool, InfluxConfig, InfluxEndpoint, JsonEndpoint,
        LiveEndpoint, SaverConfig,
    },
    hypervisor::{Hypervisor, MockHypervisor},
    topology::{self, RawTopology},
    Scheduler, SchedulerContext, SchedulerHandle, Shutdown, SubsetManager, Topology,
};

const DEBUG_DIR: &str = "debug";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to VMSCHED_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmsched local scheduler");

    let topology = Arc::new(load_topology(&args, &config)?);
    info!(
        cpus = topology.cpus().count(),
        numa_nodes = topology.nodes().count(),
        excluded = ?config.excluded_cpus,
        "Topology loaded"
    );

    let stages = Shutdown::new();

    let hypervisor: Arc<dyn Hypervisor> = match args.hypervisor {
        HypervisorKind::Mock => {
            warn!("Using the in-memory mock hypervisor; no real domains are managed");
            Arc::new(MockHypervisor::new())
        }
    };

    let pool = build_pool(&args, hypervisor.clone()).await?;

    let manager = SubsetManager::new(topology.clone(), config.manager.clone());
    let scheduler_config = config.scheduler();
    let (handle, partition) = SchedulerHandle::spawn(
        manager,
        hypervisor,
        scheduler_config.mailbox_size,
        stages.partition_signal(),
    );

    let scheduler = Scheduler::new(SchedulerContext {
        topology: topology.clone(),
        handle: handle.clone(),
        pool,
        config: scheduler_config,
    });
    let scheduler_handle = tokio::spawn(scheduler.run(stages.loop_signal()));

    let app = api::create_router(ApiState { handle, topology });
    let listener = tokio::net::TcpListener::bind(config.api_addr).await?;
    info!(addr = %config.api_addr, "Listening for connections");

    let mut shutdown_rx = stages.loop_signal();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // The loop finishes its tick before the partition stops taking messages.
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    stages
        .stop(scheduler_handle, partition, shutdown_timeout)
        .await;

    info!("Local scheduler shutdown complete");
    Ok(())
}

fn load_topology(args: &Args, config: &Config) -> Result<Topology> {
    let mut raw = match &args.topology {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read topology {}", path.display()))?;
            RawTopology::from_json(&json)?
        }
        None => topology::explore()?,
    };
    raw.exclude_cpus(&config.excluded_cpus);

    if args.debug > 0 {
        std::fs::create_dir_all(DEBUG_DIR)?;
        let dump = Path::new(DEBUG_DIR).join("topology_local.json");
        std::fs::write(&dump, raw.to_json()?)?;
        info!(path = %dump.display(), "Dumped topology");
    }

    Ok(Topology::build_with_granule(raw, config.memory_granule_bytes)?)
}

async fn build_pool(args: &Args, hypervisor: Arc<dyn Hypervisor>) -> Result<EndpointPool> {
    let loader: Arc<dyn Endpoint> = match &args.replay {
        Some(path) => Arc::new(JsonEndpoint::open(Some(path.as_path()), None).await?),
        None => Arc::new(LiveEndpoint::new(hypervisor)),
    };
    let mut pool = EndpointPool::new(loader);

    if args.debug > 0 {
        let path = Path::new(DEBUG_DIR).join("monitoring.csv");
        pool = pool.with_saver(Arc::new(CsvEndpoint::recorder(path)), SaverConfig::default());
    }
    if let Some(path) = &args.record {
        let recorder = JsonEndpoint::open(None, Some(path.clone())).await?;
        pool = pool.with_saver(Arc::new(recorder), SaverConfig::default());
    }
    if args.influx {
        let influx = InfluxEndpoint::new(InfluxConfig::from_env()?)?;
        pool = pool.with_saver(Arc::new(influx), SaverConfig::default());
    }

    Ok(pool)
}
