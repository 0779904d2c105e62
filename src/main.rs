use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loomdb::budget::compute_memory_budget;
use loomdb::cli::{resolve_settings, Args};
use loomdb::config::{load_supervisor_config, SupervisorConfig, SystemResources};
use loomdb::pool::{PoolManager, WorkerOptions};
use loomdb::router::{start_socket_server, RouterConfig};
use loomdb::server::start_ops_server;
use loomdb::worker::EchoService;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    // Load and validate the supervisor config file
    let file_config = match &args.config {
        Some(path) => match load_supervisor_config(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config file {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => SupervisorConfig::default(),
    };

    let system = SystemResources::detect();
    let settings = resolve_settings(&args, &file_config, system);

    let budget = match compute_memory_budget(
        settings.workers,
        settings.total_memory_mb,
        settings.licensed_memory_mb,
    ) {
        Ok(budget) => budget,
        Err(e) => {
            error!("Invalid worker configuration: {}", e);
            process::exit(1);
        }
    };

    info!(
        "Starting loomdb supervisor: {} workers, {} MB old-gen each ({} MB system memory)",
        settings.workers, budget.old_gen_mb, settings.total_memory_mb
    );

    // Start the pool
    let pool = PoolManager::new(budget);
    let service = Arc::new(EchoService);
    for _ in 0..settings.workers {
        let options = match &settings.worker_name {
            Some(name) => WorkerOptions::named(name.clone()),
            None => WorkerOptions::default(),
        };
        if let Err(e) = pool.start_worker(service.clone(), options) {
            error!("Failed to start worker: {}", e);
            process::exit(1);
        }
    }

    // Start the connection router
    let router_config = RouterConfig::default()
        .with_strategy(settings.strategy.clone())
        .with_affinity_ttl(settings.affinity_ttl)
        .with_no_worker_policy(settings.no_worker_policy);

    let server = match start_socket_server(
        pool.clone(),
        &settings.bind_addr,
        settings.listen_port,
        router_config,
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start socket server: {}", e);
            process::exit(1);
        }
    };
    info!(
        "Routing connections on {} via {}",
        server.local_addr(),
        settings.strategy
    );

    // Start the ops surface when configured
    let ops = match settings.ops_port {
        Some(port) => match start_ops_server(pool.clone(), &settings.bind_addr, port).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Failed to start ops server: {}", e);
                process::exit(1);
            }
        },
        None => None,
    };

    // Run until interrupted
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    server.stop();
    if let Some(ops) = ops {
        ops.stop();
    }
    pool.shutdown().await;
}
