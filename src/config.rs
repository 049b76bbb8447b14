//! Runtime configuration.
//!
//! One [`Config`] value is built at process start and handed to each
//! component's constructor. Defaults come from [`crate::constants`]; an
//! optional JSON file and a few environment variables override them.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `MOCKER_HOME` | `base_dir` |
//! | `MOCKER_STATE_DIR` | `state_dir` |
//! | `MOCKER_REGISTRY` | `registry.registry_url` |
//! | `MOCKER_AUTH_URL` | `registry.auth_url` |

use crate::constants::{
    DEFAULT_AUTH_SERVICE, DEFAULT_AUTH_URL, DEFAULT_BRIDGE, DEFAULT_CGROUP_ROOT,
    DEFAULT_CPU_PERCENT, DEFAULT_GATEWAY, DEFAULT_HOST_RANGE_END, DEFAULT_HOST_RANGE_START,
    DEFAULT_LIBRARY, DEFAULT_MAC_PREFIX, DEFAULT_MAX_LAYER_BYTES, DEFAULT_MAX_RETRIES,
    DEFAULT_MEMORY_MB, DEFAULT_NETNS_DIR, DEFAULT_PREFIX_LEN, DEFAULT_PULL_CONCURRENCY,
    DEFAULT_REGISTRY_URL, DEFAULT_RETRY_BASE_DELAY, DEFAULT_STATE_DIR, DEFAULT_SUBNET,
    IMAGE_PULL_TIMEOUT, LEASES_DIR, STORE_DIR_NAME,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Image store directory.
    pub base_dir: PathBuf,
    /// Transient runtime state (address leases).
    pub state_dir: PathBuf,
    pub registry: RegistryConfig,
    pub network: NetworkConfig,
    pub cgroup: CgroupConfig,
    /// Limits applied when a launch request carries none.
    pub limits: ResourceLimits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            registry: RegistryConfig::default(),
            network: NetworkConfig::default(),
            cgroup: CgroupConfig::default(),
            limits: ResourceLimits::default(),
        }
    }
}

impl Config {
    /// Loads configuration from an optional JSON file, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
                serde_json::from_str(&raw)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Applies `MOCKER_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(dir) = env_override("MOCKER_HOME") {
            self.base_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_override("MOCKER_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_override("MOCKER_REGISTRY") {
            self.registry.registry_url = url;
        }
        if let Some(url) = env_override("MOCKER_AUTH_URL") {
            self.registry.auth_url = url;
        }
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.limits.validate()?;
        if self.registry.pull_concurrency == 0 {
            return Err(Error::Config("registry.pull_concurrency must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Directory holding address lease files.
    pub fn leases_dir(&self) -> PathBuf {
        self.state_dir.join(LEASES_DIR)
    }
}

fn env_override(key: &str) -> Option<String> {
    let value = std::env::var(key).ok().filter(|v| !v.is_empty())?;
    debug!(key, value = %value, "config override from environment");
    Some(value)
}

fn default_base_dir() -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        home.join(STORE_DIR_NAME)
    } else {
        PathBuf::from(STORE_DIR_NAME)
    }
}

/// Registry endpoints and transfer policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// API root, including the `/v2` suffix.
    pub registry_url: String,
    /// Token endpoint.
    pub auth_url: String,
    /// `service` parameter of token requests.
    pub service: String,
    /// Library used for bare image names.
    pub library: String,
    pub timeout_secs: u64,
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    /// Layer downloads in flight at once.
    pub pull_concurrency: usize,
    pub max_layer_bytes: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            service: DEFAULT_AUTH_SERVICE.to_string(),
            library: DEFAULT_LIBRARY.to_string(),
            timeout_secs: IMAGE_PULL_TIMEOUT.as_secs(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            pull_concurrency: DEFAULT_PULL_CONCURRENCY,
            max_layer_bytes: DEFAULT_MAX_LAYER_BYTES,
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

/// Bridge, subnet and namespace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bridge: String,
    pub subnet: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    /// First allocatable host octet.
    pub host_range_start: u8,
    /// Last allocatable host octet.
    pub host_range_end: u8,
    /// First five MAC octets, colon separated.
    pub mac_prefix: String,
    /// Where `ip netns` publishes namespace handles.
    pub netns_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.to_string(),
            subnet: Ipv4Addr::from(DEFAULT_SUBNET),
            prefix_len: DEFAULT_PREFIX_LEN,
            gateway: Ipv4Addr::from(DEFAULT_GATEWAY),
            host_range_start: DEFAULT_HOST_RANGE_START,
            host_range_end: DEFAULT_HOST_RANGE_END,
            mac_prefix: DEFAULT_MAC_PREFIX.to_string(),
            netns_dir: PathBuf::from(DEFAULT_NETNS_DIR),
        }
    }
}

impl NetworkConfig {
    /// Host addresses are allocated in the last octet only.
    pub fn validate(&self) -> Result<()> {
        if self.prefix_len != 24 {
            return Err(Error::Config(format!(
                "network.prefix_len must be 24, got {}",
                self.prefix_len
            )));
        }
        if self.host_range_start == 0 || self.host_range_start > self.host_range_end || self.host_range_end == 255 {
            return Err(Error::Config(format!(
                "network host range {}..={} is invalid",
                self.host_range_start, self.host_range_end
            )));
        }
        if self.gateway.octets()[..3] != self.subnet.octets()[..3] {
            return Err(Error::Config(format!(
                "gateway {} is outside subnet {}/{}",
                self.gateway, self.subnet, self.prefix_len
            )));
        }
        if self.mac_prefix.split(':').count() != 5 {
            return Err(Error::Config(format!(
                "network.mac_prefix must have five octets, got '{}'",
                self.mac_prefix
            )));
        }
        Ok(())
    }

    /// Gateway in CIDR notation, as assigned to the bridge.
    pub fn gateway_cidr(&self) -> String {
        format!("{}/{}", self.gateway, self.prefix_len)
    }

    /// Host address with the given last octet.
    pub fn host_address(&self, octet: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.octets();
        Ipv4Addr::new(a, b, c, octet)
    }

    /// Path of a named namespace handle.
    pub fn netns_path(&self, name: &str) -> PathBuf {
        self.netns_dir.join(name)
    }
}

/// cgroup filesystem settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// cgroupfs mount point.
    pub root: PathBuf,
    /// Owner of the per-user hierarchy; detected when unset.
    pub user: Option<String>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            user: None,
        }
    }
}

/// CPU and memory ceilings for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Percent of one CPU (1-100).
    pub cpu_percent: u32,
    /// Memory ceiling in MiB.
    pub memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_percent: DEFAULT_CPU_PERCENT,
            memory_mb: DEFAULT_MEMORY_MB,
        }
    }
}

const BYTES_PER_MB: u64 = 1024 * 1024;

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_percent == 0 || self.cpu_percent > 100 {
            return Err(Error::Config(format!(
                "cpu_percent must be within 1..=100, got {}",
                self.cpu_percent
            )));
        }
        if self.memory_mb == 0 {
            return Err(Error::Config("memory_mb must be positive".to_string()));
        }
        if self.memory_mb.checked_mul(BYTES_PER_MB).is_none() {
            return Err(Error::Config(format!(
                "memory_mb {} does not fit in a byte count",
                self.memory_mb
            )));
        }
        Ok(())
    }

    /// Memory ceiling in bytes. Saturates for limits that failed validation.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(BYTES_PER_MB)
    }
}
