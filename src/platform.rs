//! Host capability detection.
//!
//! Running a container needs network namespaces, a mounted cgroup
//! hierarchy, the `ip` tool and root privileges. [`Platform::detect`]
//! probes each so the CLI can refuse early with one clear message instead
//! of failing halfway through setup.

use crate::cgroup::CgroupVersion;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::Path;

/// Detected host information.
#[derive(Debug, Clone)]
pub struct Platform {
    pub arch: Arch,
    /// Kernel release (if detectable).
    pub kernel_version: Option<String>,
    pub cgroup_version: Option<CgroupVersion>,
    pub capabilities: BTreeSet<Capability>,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

/// Host features the launcher depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Network namespaces
    NetworkNamespaces,
    /// cgroup v1 or v2 hierarchy
    Cgroups,
    /// `ip` from iproute2
    IpRoute2,
    /// Effective uid 0
    Root,
}

impl Capability {
    fn describe(self) -> &'static str {
        match self {
            Self::NetworkNamespaces => "network namespaces",
            Self::Cgroups => "a cgroup hierarchy",
            Self::IpRoute2 => "the ip(8) tool",
            Self::Root => "root privileges",
        }
    }
}

impl Platform {
    /// Probes the host, looking for cgroups under `cgroup_root`.
    pub fn detect(cgroup_root: &Path) -> Self {
        let cgroup_version = CgroupVersion::detect(cgroup_root);
        let mut capabilities = BTreeSet::new();

        if Path::new("/proc/self/ns/net").exists() {
            capabilities.insert(Capability::NetworkNamespaces);
        }
        if cgroup_version.is_some() {
            capabilities.insert(Capability::Cgroups);
        }
        if Self::check_ip() {
            capabilities.insert(Capability::IpRoute2);
        }
        if nix::unistd::geteuid().is_root() {
            capabilities.insert(Capability::Root);
        }

        Self {
            arch: Self::detect_arch(),
            kernel_version: Self::detect_kernel_version(),
            cgroup_version,
            capabilities,
        }
    }

    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return Arch::Unknown;
    }

    fn detect_kernel_version() -> Option<String> {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn check_ip() -> bool {
        std::process::Command::new("ip")
            .arg("-V")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Capabilities a launch needs that this host lacks.
    pub fn missing(&self) -> Vec<Capability> {
        [
            Capability::NetworkNamespaces,
            Capability::Cgroups,
            Capability::IpRoute2,
            Capability::Root,
        ]
        .into_iter()
        .filter(|c| !self.has(*c))
        .collect()
    }

    /// Fails unless every launch prerequisite is present.
    ///
    /// # Errors
    ///
    /// [`Error::Permission`] listing what is missing.
    pub fn require_container_support(&self) -> Result<()> {
        let missing = self.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = missing.iter().map(|c| c.describe()).collect();
        Err(Error::Permission {
            operation: "run container".to_string(),
            reason: format!("host lacks {}", names.join(", ")),
        })
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "linux/{:?} kernel {} (capabilities: {:?})",
            self.arch,
            self.kernel_version.as_deref().unwrap_or("unknown"),
            self.capabilities
        )
    }
}
