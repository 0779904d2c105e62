//! Command-line interface and settings resolution
//!
//! Flags override the config file, which overrides system detection. The
//! resolved [`Settings`] struct is what the rest of the supervisor consumes.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::config::{SupervisorConfig, SystemResources};
use crate::router::{NoWorkerPolicy, RoutingStrategy, DEFAULT_AFFINITY_TTL};

/// Default port for the connection router.
pub const DEFAULT_LISTEN_PORT: u16 = 9925;

#[derive(Parser, Debug)]
#[command(name = "loomdb")]
#[command(about = "LoomDB worker-pool supervisor and connection router")]
#[command(version)]
pub struct Args {
    /// Path to a supervisor config file (YAML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Worker count; defaults to the CPU count
    #[arg(long, env = "LOOMDB_WORKERS")]
    pub workers: Option<u32>,

    /// Group tag for workers started at boot
    #[arg(long, env = "LOOMDB_WORKER_NAME")]
    pub worker_name: Option<String>,

    /// Bind address for the listening sockets
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Connection router port
    #[arg(long, env = "LOOMDB_PORT")]
    pub port: Option<u16>,

    /// Ops HTTP port (disabled when unset)
    #[arg(long, env = "LOOMDB_OPS_PORT")]
    pub ops_port: Option<u16>,

    /// Routing strategy: most-idle, remote-affinity, or a header name
    #[arg(long, env = "LOOMDB_STRATEGY")]
    pub strategy: Option<String>,

    /// Licensed memory ceiling in MB
    #[arg(long, env = "LOOMDB_LICENSED_MEMORY_MB")]
    pub licensed_memory_mb: Option<u64>,

    /// Affinity entry time-to-live in seconds
    #[arg(long)]
    pub affinity_ttl_secs: Option<u64>,

    /// Queue connections while no worker is live instead of rejecting them
    #[arg(long)]
    pub queue_connections: bool,

    /// Load environment variables from this file
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Fully resolved supervisor settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub workers: u32,
    pub worker_name: Option<String>,
    pub bind_addr: String,
    pub listen_port: u16,
    pub ops_port: Option<u16>,
    pub strategy: RoutingStrategy,
    pub affinity_ttl: Duration,
    pub total_memory_mb: u64,
    pub licensed_memory_mb: Option<u64>,
    pub no_worker_policy: NoWorkerPolicy,
}

/// Merge flags, config file, and system detection, in that precedence order.
pub fn resolve_settings(
    args: &Args,
    file: &SupervisorConfig,
    system: SystemResources,
) -> Settings {
    let strategy = args
        .strategy
        .as_deref()
        .or(file.strategy.as_deref())
        .map(RoutingStrategy::parse)
        .unwrap_or(RoutingStrategy::MostIdle);

    let no_worker_policy = if args.queue_connections {
        NoWorkerPolicy::Queue
    } else {
        file.no_worker_policy.unwrap_or_default()
    };

    Settings {
        workers: args.workers.or(file.workers).unwrap_or(system.cpu_count),
        worker_name: args.worker_name.clone().or_else(|| file.worker_name.clone()),
        bind_addr: args.bind_addr.clone(),
        listen_port: args
            .port
            .or(file.listen_port)
            .unwrap_or(DEFAULT_LISTEN_PORT),
        ops_port: args.ops_port.or(file.ops_port),
        strategy,
        affinity_ttl: args
            .affinity_ttl_secs
            .or(file.affinity_ttl_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_AFFINITY_TTL),
        total_memory_mb: system.total_memory_mb,
        licensed_memory_mb: args.licensed_memory_mb.or(file.licensed_memory_mb),
        no_worker_policy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_args() -> Args {
        Args::parse_from(["loomdb"])
    }

    fn test_system() -> SystemResources {
        SystemResources {
            cpu_count: 8,
            total_memory_mb: 16384,
        }
    }

    #[test]
    fn test_defaults_from_system() {
        let settings = resolve_settings(&bare_args(), &SupervisorConfig::default(), test_system());
        assert_eq!(settings.workers, 8);
        assert_eq!(settings.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(settings.strategy, RoutingStrategy::MostIdle);
        assert_eq!(settings.no_worker_policy, NoWorkerPolicy::Reject);
        assert_eq!(settings.affinity_ttl, DEFAULT_AFFINITY_TTL);
    }

    #[test]
    fn test_file_overrides_system() {
        let file = SupervisorConfig {
            workers: Some(4),
            strategy: Some("remote-affinity".to_string()),
            listen_port: Some(7000),
            ..SupervisorConfig::default()
        };
        let settings = resolve_settings(&bare_args(), &file, test_system());
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.listen_port, 7000);
        assert_eq!(settings.strategy, RoutingStrategy::RemoteAffinity);
    }

    #[test]
    fn test_flags_override_file() {
        let args = Args::parse_from([
            "loomdb",
            "--workers",
            "2",
            "--strategy",
            "authorization",
            "--queue-connections",
        ]);
        let file = SupervisorConfig {
            workers: Some(4),
            strategy: Some("most-idle".to_string()),
            ..SupervisorConfig::default()
        };
        let settings = resolve_settings(&args, &file, test_system());
        assert_eq!(settings.workers, 2);
        assert_eq!(
            settings.strategy,
            RoutingStrategy::HeaderAffinity("authorization".to_string())
        );
        assert_eq!(settings.no_worker_policy, NoWorkerPolicy::Queue);
    }
}
