//! Process and fabric configuration.
//!
//! Process settings come from the environment ([`Config::from_env`]). The
//! fabric description (zones, registry, roles, GPU groups, job tuning) is a
//! TOML file loaded once at startup ([`FabricConfig::load`]).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::db::DbConfig;

/// Which resource store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub config_file: Option<PathBuf>,
    pub job_workers: usize,
    pub store: StoreBackend,
    pub gpu_sync_interval: Duration,
    pub database: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FABRIC_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()?;

        let log_level = std::env::var("FABRIC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("FABRIC_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let config_file = std::env::var("FABRIC_CONFIG_FILE").ok().map(PathBuf::from);

        let job_workers = std::env::var("FABRIC_JOB_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or_else(default_job_workers);

        let store = match std::env::var("FABRIC_STORE").as_deref() {
            Ok("memory") => StoreBackend::Memory,
            Ok("postgres") | Err(_) => StoreBackend::Postgres,
            Ok(other) => anyhow::bail!("unknown FABRIC_STORE '{other}' (expected postgres or memory)"),
        };

        let gpu_sync_interval = std::env::var("FABRIC_GPU_SYNC_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(60));

        let database = DbConfig::from_env();

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            config_file,
            job_workers,
            store,
            gpu_sync_interval,
            database,
        })
    }
}

/// One worker per available CPU.
pub fn default_job_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// =============================================================================
// Fabric description
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Public URL of this control plane, used for inbound webhooks.
    pub external_url: String,
    pub manager: ManagerConfig,
    pub zones: Vec<ZoneConfig>,
    pub registry: RegistryConfig,
    pub github: GithubConfig,
    pub roles: Vec<RoleConfig>,
    pub default_role: String,
    pub gpu_groups: Vec<GpuGroupConfig>,
    pub excluded_hosts: Vec<String>,
    pub excluded_gpus: Vec<String>,
    pub privileged_gpus: Vec<String>,
    pub jobs: JobSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Identity recorded as the user of system-initiated jobs.
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Resource kinds this zone can host: `deployment`, `vm`, `sm`, `gpu`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub deployment_domain: String,
    pub storage_domain: String,
    pub nfs_server: String,
    #[serde(default = "default_nfs_path")]
    pub nfs_path: String,
    #[serde(default)]
    pub vm_hosts: Vec<String>,
    pub port_range: PortRange,
}

fn default_nfs_path() -> String {
    "/mnt/cloud".to_string()
}

impl ZoneConfig {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    /// Exclusive.
    pub end: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    /// Image copied into fresh repositories: `project/repository:tag`.
    pub placeholder_image: String,
    /// Talk to a real registry over HTTP instead of the in-process one.
    pub http: bool,
    /// Token the registry presents on push notifications.
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub permissions: RolePermissions,
    pub quotas: RoleQuotas,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RolePermissions {
    pub use_custom_deployments: bool,
    pub use_gpus: bool,
    pub use_privileged_gpus: bool,
    pub use_vms: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleQuotas {
    pub deployments: i64,
    pub cpu_cores: i64,
    /// GB
    pub ram: i64,
    /// GB
    pub disk_size: i64,
    pub snapshots: i64,
    /// Hours
    pub gpu_lease_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuGroupConfig {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub zone: String,
    #[serde(default)]
    pub vendor: String,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub max_attempts: u32,
    pub repair_on_v2_vm_create_failure: bool,
    pub deployment_drain_secs: u64,
    pub vm_drain_secs: u64,
    pub drain_poll_millis: u64,
    pub guard_backoff_secs: u64,
    pub idle_poll_millis: u64,
    pub cancel_poll_millis: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_attempts: fabric_reconcile::DEFAULT_MAX_RETRIES,
            repair_on_v2_vm_create_failure: true,
            deployment_drain_secs: 30,
            vm_drain_secs: 300,
            drain_poll_millis: 1000,
            guard_backoff_secs: 5,
            idle_poll_millis: 500,
            cancel_poll_millis: 1000,
        }
    }
}

impl JobSettings {
    pub fn deployment_drain(&self) -> Duration {
        Duration::from_secs(self.deployment_drain_secs)
    }

    pub fn vm_drain(&self) -> Duration {
        Duration::from_secs(self.vm_drain_secs)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_millis)
    }

    pub fn guard_backoff(&self) -> Duration {
        Duration::from_secs(self.guard_backoff_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_millis)
    }

    pub fn cancel_poll(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_millis)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            user_id: "system".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "registry.fabric.local".to_string(),
            user: "admin".to_string(),
            password: String::new(),
            placeholder_image: "library/placeholder:latest".to_string(),
            http: false,
            webhook_secret: String::new(),
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            external_url: "http://127.0.0.1:8080".to_string(),
            manager: ManagerConfig::default(),
            zones: vec![ZoneConfig {
                name: "dev".to_string(),
                description: "Local development zone".to_string(),
                capabilities: ["deployment", "vm", "sm", "gpu"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                deployment_domain: "app.fabric.local".to_string(),
                storage_domain: "storage.fabric.local".to_string(),
                nfs_server: "nfs.fabric.local".to_string(),
                nfs_path: default_nfs_path(),
                vm_hosts: vec!["host-1".to_string(), "host-2".to_string()],
                port_range: PortRange {
                    start: 30000,
                    end: 30100,
                },
            }],
            registry: RegistryConfig::default(),
            github: GithubConfig::default(),
            roles: vec![
                RoleConfig {
                    name: "default".to_string(),
                    description: "Default role for new users".to_string(),
                    permissions: RolePermissions {
                        use_custom_deployments: true,
                        use_gpus: true,
                        use_privileged_gpus: false,
                        use_vms: true,
                    },
                    quotas: RoleQuotas {
                        deployments: 5,
                        cpu_cores: 4,
                        ram: 8,
                        disk_size: 50,
                        snapshots: 2,
                        gpu_lease_duration: 168.0,
                    },
                },
                RoleConfig {
                    name: "power".to_string(),
                    description: "Extended quotas".to_string(),
                    permissions: RolePermissions {
                        use_custom_deployments: true,
                        use_gpus: true,
                        use_privileged_gpus: true,
                        use_vms: true,
                    },
                    quotas: RoleQuotas {
                        deployments: 20,
                        cpu_cores: 32,
                        ram: 64,
                        disk_size: 500,
                        snapshots: 10,
                        gpu_lease_duration: 720.0,
                    },
                },
            ],
            default_role: "default".to_string(),
            gpu_groups: vec![GpuGroupConfig {
                name: "nvidia-a100".to_string(),
                display_name: "NVIDIA A100".to_string(),
                zone: "dev".to_string(),
                vendor: "NVIDIA".to_string(),
                total: 1,
            }],
            excluded_hosts: Vec::new(),
            excluded_gpus: Vec::new(),
            privileged_gpus: Vec::new(),
            jobs: JobSettings::default(),
        }
    }
}

impl FabricConfig {
    /// Load the fabric description, falling back to development defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read fabric config: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("invalid fabric config: {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("invalid fabric config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.zones.is_empty() {
            anyhow::bail!("at least one zone must be configured");
        }
        if self.role(&self.default_role).is_none() {
            anyhow::bail!("default role '{}' is not defined", self.default_role);
        }
        for zone in &self.zones {
            if zone.port_range.start >= zone.port_range.end {
                anyhow::bail!("zone '{}' has an empty port range", zone.name);
            }
        }
        for group in &self.gpu_groups {
            if self.zone(&group.zone).is_none() {
                anyhow::bail!("gpu group '{}' refers to unknown zone '{}'", group.name, group.zone);
            }
        }
        Ok(())
    }

    pub fn zone(&self, name: &str) -> Option<&ZoneConfig> {
        self.zones.iter().find(|z| z.name == name)
    }

    /// The zone new resources land in when none is requested.
    pub fn default_zone(&self) -> &ZoneConfig {
        // validate() guarantees at least one zone; Default always has one.
        &self.zones[0]
    }

    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn gpu_group(&self, name: &str) -> Option<&GpuGroupConfig> {
        self.gpu_groups.iter().find(|g| g.name == name)
    }

    pub fn is_privileged_gpu(&self, group: &str) -> bool {
        self.privileged_gpus.iter().any(|g| g == group)
    }

    pub fn is_excluded_gpu(&self, group: &str) -> bool {
        self.excluded_gpus.iter().any(|g| g == group)
    }

    pub fn is_excluded_host(&self, host: &str) -> bool {
        self.excluded_hosts.iter().any(|h| h == host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FabricConfig::default();
        config.validate().unwrap();
        assert_eq!(config.default_zone().name, "dev");
        assert_eq!(config.jobs.max_attempts, 3);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = FabricConfig::from_toml_str(
            r#"
default_role = "student"

[[zones]]
name = "se-flem"
capabilities = ["deployment", "vm"]
deployment_domain = "app.cloud.example"
storage_domain = "storage.cloud.example"
nfs_server = "nfs.cloud.example"
port_range = { start = 26000, end = 26100 }

[[roles]]
name = "student"
quotas = { deployments = 10, cpuCores = 8, ram = 16, diskSize = 100, snapshots = 3, gpuLeaseDuration = 72.0 }

[jobs]
vm_drain_secs = 120
"#,
        )
        .unwrap();

        let zone = config.zone("se-flem").unwrap();
        assert!(zone.has_capability("vm"));
        assert!(!zone.has_capability("sm"));
        assert_eq!(zone.nfs_path, "/mnt/cloud");
        assert_eq!(config.role("student").unwrap().quotas.cpu_cores, 8);
        assert_eq!(config.jobs.vm_drain(), Duration::from_secs(120));
        // Unset job settings keep their defaults.
        assert_eq!(config.jobs.deployment_drain(), Duration::from_secs(30));
    }

    #[test]
    fn test_unknown_default_role_is_rejected() {
        let err = FabricConfig::from_toml_str(
            r#"
default_role = "missing"

[[zones]]
name = "z"
deployment_domain = "a"
storage_domain = "b"
nfs_server = "c"
port_range = { start = 1, end = 2 }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("default role"));
    }

    #[test]
    fn test_default_job_workers_is_positive() {
        assert!(default_job_workers() > 0);
    }
}
