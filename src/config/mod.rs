//! Supervisor configuration
//!
//! Configuration arrives from three places, in increasing precedence: system
//! detection (CPU count, total memory), an optional YAML config file, and
//! command-line flags. The supervisor core only ever consumes the resulting
//! numbers; how they were produced is not its concern.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use thiserror::Error;

use crate::router::NoWorkerPolicy;

/// Errors for configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Supervisor config file contents. Every field is optional; unset fields
/// fall back to detection or defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Worker count; defaults to the machine's CPU count.
    pub workers: Option<u32>,

    /// Group tag given to every worker started at boot.
    pub worker_name: Option<String>,

    /// Port the connection router listens on.
    pub listen_port: Option<u16>,

    /// Port for the ops HTTP surface; disabled when unset.
    pub ops_port: Option<u16>,

    /// Routing strategy: `most-idle`, `remote-affinity`, or a header name.
    pub strategy: Option<String>,

    /// Affinity entry time-to-live in seconds.
    pub affinity_ttl_secs: Option<u64>,

    /// Licensed memory ceiling in MB; caps the per-worker old-gen budget.
    pub licensed_memory_mb: Option<u64>,

    /// What to do with connections when no worker is live.
    pub no_worker_policy: Option<NoWorkerPolicy>,
}

impl SupervisorConfig {
    /// Parse from YAML. Pure function; file I/O lives in
    /// [`load_supervisor_config`].
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: SupervisorConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.affinity_ttl_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "affinity_ttl_secs must be positive".to_string(),
            ));
        }
        if let (Some(listen), Some(ops)) = (self.listen_port, self.ops_port) {
            if listen == ops {
                return Err(ConfigError::Invalid(format!(
                    "listen_port and ops_port are both {}",
                    listen
                )));
            }
        }
        Ok(())
    }
}

/// Load and validate a supervisor config file from disk.
pub fn load_supervisor_config(path: &Path) -> Result<SupervisorConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    SupervisorConfig::from_yaml(&content)
}

/// Machine facts the supervisor consumes read-only.
#[derive(Debug, Clone, Copy)]
pub struct SystemResources {
    pub cpu_count: u32,
    pub total_memory_mb: u64,
}

impl SystemResources {
    /// Detect from the running system.
    pub fn detect() -> Self {
        let mut system = System::new_all();
        system.refresh_memory();
        Self {
            cpu_count: (system.cpus().len() as u32).max(1),
            total_memory_mb: (system.total_memory() / (1024 * 1024)).max(1),
        }
    }
}
