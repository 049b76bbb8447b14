//! # Resource Limits
//!
//! Creates one control group per container under a per-user hierarchy and
//! writes its CPU and memory ceilings. Both cgroup layouts are handled:
//!
//! | Layout | Group directories | CPU | Memory |
//! |--------|-------------------|-----|--------|
//! | v2 (unified) | `<root>/<user>/<name>` | `cpu.max` | `memory.max` |
//! | v1 (per controller) | `<root>/cpu/<user>/<name>`, `<root>/memory/<user>/<name>` | `cpu.shares`, `cpu.cfs_quota_us` | `memory.limit_in_bytes` |
//!
//! The target process joins the group from inside the forked child, before
//! exec (see [`crate::runtime`]); [`ResourceLimiter::add_process`] admits
//! an already running PID.

use crate::config::{CgroupConfig, ResourceLimits};
use crate::constants::{CPU_PERIOD_US, CPU_SHARES_PER_CPU};
use crate::error::{Error, Result};
use crate::identity::ContainerIdentity;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PROCS_FILE: &str = "cgroup.procs";
const SUBTREE_CONTROL: &str = "cgroup.subtree_control";

/// cgroup filesystem layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl CgroupVersion {
    /// Detects the layout mounted at `root`.
    pub fn detect(root: &Path) -> Option<Self> {
        if root.join("cgroup.controllers").exists() {
            Some(Self::V2)
        } else if root.join("cpu").is_dir() && root.join("memory").is_dir() {
            Some(Self::V1)
        } else {
            None
        }
    }
}

/// A created control group.
#[derive(Debug, Clone)]
pub struct CgroupHandle {
    name: String,
    /// One directory for v2; cpu then memory for v1.
    dirs: Vec<PathBuf>,
    limits: ResourceLimits,
}

impl CgroupHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// `cgroup.procs` of every group directory; writing a PID to each
    /// moves that process into the group.
    pub fn procs_files(&self) -> Vec<PathBuf> {
        self.dirs.iter().map(|d| d.join(PROCS_FILE)).collect()
    }
}

/// Creates and removes per-container control groups.
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    root: PathBuf,
    user: String,
    version: CgroupVersion,
}

impl ResourceLimiter {
    /// Opens the hierarchy described by `config`.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceLimit`] if no cgroup filesystem is mounted there.
    pub fn new(config: &CgroupConfig) -> Result<Self> {
        let version = CgroupVersion::detect(&config.root).ok_or_else(|| {
            Error::ResourceLimit(format!(
                "no cgroup hierarchy found at {}",
                config.root.display()
            ))
        })?;
        let user = config.user.clone().unwrap_or_else(login_user);
        debug!(root = %config.root.display(), ?version, user = %user, "cgroup hierarchy detected");
        Ok(Self::with_version(config.root.clone(), user, version))
    }

    pub fn with_version(root: PathBuf, user: String, version: CgroupVersion) -> Self {
        Self {
            root,
            user,
            version,
        }
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    /// Creates the group for `identity` and writes its limits.
    ///
    /// # Errors
    ///
    /// [`Error::Permission`] when the hierarchy is not writable,
    /// [`Error::ResourceLimit`] otherwise. Directories created before the
    /// failure are removed.
    pub fn apply(&self, identity: &ContainerIdentity, limits: &ResourceLimits) -> Result<CgroupHandle> {
        limits.validate()?;
        let name = identity.short_name();

        let handle = match self.version {
            CgroupVersion::V2 => {
                let parent = self.root.join(&self.user);
                create_dir(&parent)?;
                enable_controllers(&self.root);
                enable_controllers(&parent);
                CgroupHandle {
                    name: name.clone(),
                    dirs: vec![parent.join(&name)],
                    limits: *limits,
                }
            }
            CgroupVersion::V1 => CgroupHandle {
                name: name.clone(),
                dirs: vec![
                    self.root.join("cpu").join(&self.user).join(&name),
                    self.root.join("memory").join(&self.user).join(&name),
                ],
                limits: *limits,
            },
        };

        if let Err(e) = self.configure(&handle) {
            if let Err(cleanup) = self.release(&handle) {
                warn!(cgroup = %name, error = %cleanup, "failed to remove partial cgroup");
            }
            return Err(e);
        }

        info!(
            cgroup = %name,
            cpu_percent = limits.cpu_percent,
            memory_mb = limits.memory_mb,
            "resource limits applied"
        );
        Ok(handle)
    }

    fn configure(&self, handle: &CgroupHandle) -> Result<()> {
        for dir in &handle.dirs {
            create_dir(dir)?;
        }

        let limits = handle.limits;
        let quota = CPU_PERIOD_US * u64::from(limits.cpu_percent) / 100;
        match self.version {
            CgroupVersion::V2 => {
                let dir = &handle.dirs[0];
                write_control(&dir.join("cpu.max"), &format!("{} {}", quota, CPU_PERIOD_US))?;
                write_control(&dir.join("memory.max"), &limits.memory_bytes().to_string())?;
            }
            CgroupVersion::V1 => {
                let (cpu, memory) = (&handle.dirs[0], &handle.dirs[1]);
                let shares = CPU_SHARES_PER_CPU * u64::from(limits.cpu_percent) / 100;
                write_control(&cpu.join("cpu.shares"), &shares.to_string())?;
                write_control(&cpu.join("cpu.cfs_period_us"), &CPU_PERIOD_US.to_string())?;
                write_control(&cpu.join("cpu.cfs_quota_us"), &quota.to_string())?;
                write_control(
                    &memory.join("memory.limit_in_bytes"),
                    &limits.memory_bytes().to_string(),
                )?;
            }
        }
        Ok(())
    }

    /// Moves `pid` into the group.
    pub fn add_process(&self, handle: &CgroupHandle, pid: u32) -> Result<()> {
        for procs in handle.procs_files() {
            write_control(&procs, &pid.to_string())?;
        }
        debug!(cgroup = %handle.name, pid, "process admitted");
        Ok(())
    }

    /// Removes the group directories. Groups already gone are skipped.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceLimit`] if a group still holds processes.
    pub fn release(&self, handle: &CgroupHandle) -> Result<()> {
        for dir in handle.dirs.iter().rev() {
            remove_group(dir)?;
        }
        debug!(cgroup = %handle.name, "cgroup released");
        Ok(())
    }
}

/// Name of the user the hierarchy belongs to: the user who invoked sudo,
/// then the login user, then the numeric uid.
fn login_user() -> String {
    ["SUDO_USER", "USER"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|v| !v.is_empty() && !v.contains('/'))
        .unwrap_or_else(|| nix::unistd::getuid().to_string())
}

fn create_dir(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) => Err(control_error(dir, e)),
    }
}

fn write_control(file: &Path, value: &str) -> Result<()> {
    fs::write(file, value).map_err(|e| control_error(file, e))
}

fn enable_controllers(dir: &Path) {
    let control = dir.join(SUBTREE_CONTROL);
    for controller in ["+cpu", "+memory"] {
        if let Err(e) = fs::write(&control, controller) {
            debug!(path = %control.display(), controller, error = %e, "controller not enabled");
        }
    }
}

fn remove_group(dir: &Path) -> Result<()> {
    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        // cgroupfs control files vanish with the directory; a plain
        // directory tree keeps the files that were written into it.
        Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => {
            for entry in fs::read_dir(dir).map_err(|e| control_error(dir, e))? {
                let path = entry.map_err(|e| control_error(dir, e))?.path();
                if path.is_file() {
                    fs::remove_file(&path).map_err(|e| control_error(&path, e))?;
                }
            }
            fs::remove_dir(dir).map_err(|e| control_error(dir, e))
        }
        Err(e) => Err(control_error(dir, e)),
    }
}

fn control_error(path: &Path, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::PermissionDenied => Error::Permission {
            operation: "cgroup".to_string(),
            reason: format!("{}: {}", path.display(), e),
        },
        _ => Error::ResourceLimit(format!("{}: {}", path.display(), e)),
    }
}
