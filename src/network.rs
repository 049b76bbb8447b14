//! # Container Networking
//!
//! Builds one network namespace per container and wires it to a shared
//! host bridge through a veth pair:
//!
//! ```text
//!  host                                   netns_c_1a2b3c
//! ┌──────────────────────────────┐       ┌──────────────────────────────┐
//! │ bridge0 (10.0.0.1/24)        │       │ lo (up)                      │
//! │   └── veth0_c_1a2b3c ◄───────┼───────┼──► veth1_c_1a2b3c            │
//! │                              │       │     02:42:ac:11:00:<id>      │
//! │                              │       │     10.0.0.<lease>/24        │
//! │                              │       │     default via 10.0.0.1     │
//! └──────────────────────────────┘       └──────────────────────────────┘
//! ```
//!
//! ## State Machine
//!
//! `Unconfigured → VethCreated → BridgeAttached → NamespaceMoved →
//! NamespaceConfigured → TornDown`. A failure at any step tears down what
//! was created before the error is returned. Teardown removes the host-side
//! veth (its peer goes with it) and the namespace, tolerates resources that
//! are already gone, and does nothing the second time it is called. The
//! bridge is shared by all containers and is never removed.
//!
//! ## Link Control
//!
//! Link, address, route and namespace operations go through the
//! [`LinkControl`] trait. [`IpRoute2`] drives `ip(8)`; tests substitute a
//! recording fake.
//!
//! ## Addresses
//!
//! [`AddressPool`] hands out one host address per container from the
//! configured range. A lease is a file named after the address holding the
//! owner's PID. It is written to a scratch file and published with
//! `link(2)`, so it never appears partially written. Claims and reclaims of
//! leases whose owner is gone run under an exclusive `flock` on the pool.

use crate::config::NetworkConfig;
use crate::constants::LEASE_GRACE_PERIOD;
use crate::error::{Error, Result};
use crate::identity::ContainerIdentity;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Link Control
// =============================================================================

/// Failure of a single link operation.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Target link or namespace does not exist.
    #[error("{0}: not found")]
    NotFound(String),

    /// Target already exists.
    #[error("{0}: already exists")]
    Exists(String),

    /// Caller lacks CAP_NET_ADMIN.
    #[error("{0}: operation not permitted")]
    PermissionDenied(String),

    /// Any other failure.
    #[error("{command}: {message}")]
    Failed { command: String, message: String },

    /// The control tool could not be started.
    #[error("cannot run ip: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Link-layer operations needed to build a container network.
///
/// `netns` selects the namespace an operation runs in; `None` is the host.
pub trait LinkControl: Send + Sync {
    fn link_exists(&self, name: &str) -> std::result::Result<bool, LinkError>;
    fn create_veth(&self, host: &str, peer: &str) -> std::result::Result<(), LinkError>;
    fn create_bridge(&self, name: &str) -> std::result::Result<(), LinkError>;
    fn set_master(&self, link: &str, bridge: &str) -> std::result::Result<(), LinkError>;
    fn set_up(&self, netns: Option<&str>, link: &str) -> std::result::Result<(), LinkError>;
    fn set_mac(&self, netns: &str, link: &str, mac: &str) -> std::result::Result<(), LinkError>;
    fn add_address(&self, netns: Option<&str>, link: &str, cidr: &str) -> std::result::Result<(), LinkError>;
    fn add_default_route(&self, netns: &str, gateway: Ipv4Addr) -> std::result::Result<(), LinkError>;
    fn create_netns(&self, name: &str) -> std::result::Result<(), LinkError>;
    fn move_to_netns(&self, link: &str, netns: &str) -> std::result::Result<(), LinkError>;
    fn delete_link(&self, name: &str) -> std::result::Result<(), LinkError>;
    fn delete_netns(&self, name: &str) -> std::result::Result<(), LinkError>;
}

/// [`LinkControl`] backed by the `ip` command from iproute2.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ip"),
        }
    }
}

impl IpRoute2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a specific `ip` binary.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, netns: Option<&str>, args: &[&str]) -> std::result::Result<String, LinkError> {
        let mut cmd = Command::new(&self.binary);
        if let Some(ns) = netns {
            cmd.args(["-n", ns]);
        }
        cmd.args(args);

        let rendered = match netns {
            Some(ns) => format!("ip -n {} {}", ns, args.join(" ")),
            None => format!("ip {}", args.join(" ")),
        };
        debug!(command = %rendered, "running");

        let output = cmd.output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(rendered, stderr))
    }
}

/// Maps `ip` diagnostics onto [`LinkError`] kinds.
fn classify_failure(command: String, stderr: String) -> LinkError {
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        LinkError::PermissionDenied(command)
    } else if stderr.contains("File exists") {
        LinkError::Exists(command)
    } else if stderr.contains("Cannot find device")
        || stderr.contains("does not exist")
        || stderr.contains("No such file or directory")
        || stderr.contains("No such device")
    {
        LinkError::NotFound(command)
    } else {
        LinkError::Failed {
            command,
            message: stderr,
        }
    }
}

impl LinkControl for IpRoute2 {
    fn link_exists(&self, name: &str) -> std::result::Result<bool, LinkError> {
        match self.run(None, &["link", "show", "dev", name]) {
            Ok(_) => Ok(true),
            Err(LinkError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create_veth(&self, host: &str, peer: &str) -> std::result::Result<(), LinkError> {
        self.run(None, &["link", "add", host, "type", "veth", "peer", "name", peer])
            .map(drop)
    }

    fn create_bridge(&self, name: &str) -> std::result::Result<(), LinkError> {
        self.run(None, &["link", "add", name, "type", "bridge"]).map(drop)
    }

    fn set_master(&self, link: &str, bridge: &str) -> std::result::Result<(), LinkError> {
        self.run(None, &["link", "set", link, "master", bridge]).map(drop)
    }

    fn set_up(&self, netns: Option<&str>, link: &str) -> std::result::Result<(), LinkError> {
        self.run(netns, &["link", "set", link, "up"]).map(drop)
    }

    fn set_mac(&self, netns: &str, link: &str, mac: &str) -> std::result::Result<(), LinkError> {
        self.run(Some(netns), &["link", "set", link, "address", mac]).map(drop)
    }

    fn add_address(&self, netns: Option<&str>, link: &str, cidr: &str) -> std::result::Result<(), LinkError> {
        self.run(netns, &["addr", "add", cidr, "dev", link]).map(drop)
    }

    fn add_default_route(&self, netns: &str, gateway: Ipv4Addr) -> std::result::Result<(), LinkError> {
        let gateway = gateway.to_string();
        self.run(Some(netns), &["route", "add", "default", "via", &gateway])
            .map(drop)
    }

    fn create_netns(&self, name: &str) -> std::result::Result<(), LinkError> {
        self.run(None, &["netns", "add", name]).map(drop)
    }

    fn move_to_netns(&self, link: &str, netns: &str) -> std::result::Result<(), LinkError> {
        self.run(None, &["link", "set", link, "netns", netns]).map(drop)
    }

    fn delete_link(&self, name: &str) -> std::result::Result<(), LinkError> {
        self.run(None, &["link", "delete", name]).map(drop)
    }

    fn delete_netns(&self, name: &str) -> std::result::Result<(), LinkError> {
        self.run(None, &["netns", "delete", name]).map(drop)
    }
}

// =============================================================================
// Network Environment
// =============================================================================

/// Setup progress of a [`NetworkEnvironment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unconfigured,
    VethCreated,
    BridgeAttached,
    NamespaceMoved,
    NamespaceConfigured,
    TornDown,
}

/// The veth pair, namespace and addressing of one container.
pub struct NetworkEnvironment {
    links: Arc<dyn LinkControl>,
    config: NetworkConfig,
    veth_host: String,
    veth_peer: String,
    netns: String,
    mac: String,
    address: Ipv4Addr,
    state: NetworkState,
    veth_created: bool,
    netns_created: bool,
}

impl std::fmt::Debug for NetworkEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkEnvironment")
            .field("veth_host", &self.veth_host)
            .field("veth_peer", &self.veth_peer)
            .field("netns", &self.netns)
            .field("address", &self.address)
            .field("state", &self.state)
            .finish()
    }
}

impl NetworkEnvironment {
    /// Describes the environment for `identity`; nothing is created yet.
    pub fn new(
        links: Arc<dyn LinkControl>,
        config: &NetworkConfig,
        identity: &ContainerIdentity,
        address: Ipv4Addr,
    ) -> Self {
        Self {
            links,
            config: config.clone(),
            veth_host: identity.veth_host(),
            veth_peer: identity.veth_peer(),
            netns: identity.netns_name(),
            mac: identity.mac_address(&config.mac_prefix),
            address,
            state: NetworkState::Unconfigured,
            veth_created: false,
            netns_created: false,
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    pub fn netns_name(&self) -> &str {
        &self.netns
    }

    /// Namespace handle to `setns` into.
    pub fn netns_path(&self) -> PathBuf {
        self.config.netns_path(&self.netns)
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn veth_host(&self) -> &str {
        &self.veth_host
    }

    /// Creates everything up to [`NetworkState::NamespaceConfigured`].
    ///
    /// # Errors
    ///
    /// [`Error::NetworkSetup`] naming the failing step, or
    /// [`Error::Permission`] without CAP_NET_ADMIN. Partial state is torn
    /// down before the error is returned.
    pub fn setup(&mut self) -> Result<()> {
        if self.state != NetworkState::Unconfigured {
            return Err(Error::Internal(format!(
                "network setup called in state {:?}",
                self.state
            )));
        }

        if let Err(e) = self.build() {
            warn!(netns = %self.netns, error = %e, "network setup failed, tearing down");
            if let Err(t) = self.teardown() {
                warn!(netns = %self.netns, error = %t, "partial teardown failed, left for release");
            }
            return Err(e);
        }

        info!(
            netns = %self.netns,
            veth = %self.veth_host,
            address = %self.address,
            mac = %self.mac,
            "network ready"
        );
        Ok(())
    }

    fn build(&mut self) -> Result<()> {
        let links = Arc::clone(&self.links);

        links
            .create_veth(&self.veth_host, &self.veth_peer)
            .map_err(|e| step_error("create veth pair", e))?;
        self.veth_created = true;
        self.state = NetworkState::VethCreated;

        links
            .set_up(None, &self.veth_host)
            .map_err(|e| step_error("bring up host veth", e))?;

        self.ensure_bridge()?;
        links
            .set_master(&self.veth_host, &self.config.bridge)
            .map_err(|e| step_error("attach veth to bridge", e))?;
        self.state = NetworkState::BridgeAttached;

        links
            .create_netns(&self.netns)
            .map_err(|e| step_error("create namespace", e))?;
        self.netns_created = true;
        links
            .move_to_netns(&self.veth_peer, &self.netns)
            .map_err(|e| step_error("move veth into namespace", e))?;
        self.state = NetworkState::NamespaceMoved;

        let ns = Some(self.netns.as_str());
        links
            .set_up(ns, "lo")
            .map_err(|e| step_error("bring up loopback", e))?;
        links
            .set_mac(&self.netns, &self.veth_peer, &self.mac)
            .map_err(|e| step_error("set MAC address", e))?;
        let cidr = format!("{}/{}", self.address, self.config.prefix_len);
        links
            .add_address(ns, &self.veth_peer, &cidr)
            .map_err(|e| step_error("assign address", e))?;
        links
            .set_up(ns, &self.veth_peer)
            .map_err(|e| step_error("bring up namespace veth", e))?;
        links
            .add_default_route(&self.netns, self.config.gateway)
            .map_err(|e| step_error("add default route", e))?;
        self.state = NetworkState::NamespaceConfigured;
        Ok(())
    }

    /// Creates the shared bridge if missing. Losing a creation race to
    /// another launcher is not an error.
    fn ensure_bridge(&self) -> Result<()> {
        let bridge = &self.config.bridge;
        let exists = self
            .links
            .link_exists(bridge)
            .map_err(|e| step_error("inspect bridge", e))?;

        if !exists {
            match self.links.create_bridge(bridge) {
                Ok(()) => info!(bridge = %bridge, "created bridge"),
                Err(LinkError::Exists(_)) => debug!(bridge = %bridge, "bridge created concurrently"),
                Err(e) => return Err(step_error("create bridge", e)),
            }
        }

        match self
            .links
            .add_address(None, bridge, &self.config.gateway_cidr())
        {
            Ok(()) | Err(LinkError::Exists(_)) => {}
            Err(e) => return Err(step_error("assign bridge gateway", e)),
        }
        self.links
            .set_up(None, bridge)
            .map_err(|e| step_error("bring up bridge", e))
    }

    /// Removes the veth pair and the namespace. Safe to call repeatedly;
    /// once everything is removed later calls do nothing.
    ///
    /// Resources that are already gone are skipped. Other failures are
    /// reported after every removal has been attempted, and the resources
    /// that could not be removed are retried by the next call.
    pub fn teardown(&mut self) -> Result<()> {
        if self.state == NetworkState::TornDown {
            return Ok(());
        }

        let mut first_error = None;

        if self.veth_created {
            match tolerate_missing(self.links.delete_link(&self.veth_host)) {
                Ok(()) => self.veth_created = false,
                Err(e) => first_error = Some(step_error("delete veth", e)),
            }
        }
        if self.netns_created {
            match tolerate_missing(self.links.delete_netns(&self.netns)) {
                Ok(()) => self.netns_created = false,
                Err(e) => first_error = first_error.or(Some(step_error("delete namespace", e))),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                self.state = NetworkState::TornDown;
                debug!(netns = %self.netns, "network torn down");
                Ok(())
            }
        }
    }
}

fn tolerate_missing(result: std::result::Result<(), LinkError>) -> std::result::Result<(), LinkError> {
    match result {
        Err(LinkError::NotFound(what)) => {
            debug!(resource = %what, "already removed");
            Ok(())
        }
        other => other,
    }
}

fn step_error(step: &str, e: LinkError) -> Error {
    match e {
        LinkError::PermissionDenied(command) => Error::Permission {
            operation: step.to_string(),
            reason: format!("{} requires CAP_NET_ADMIN", command),
        },
        other => Error::NetworkSetup {
            step: step.to_string(),
            reason: other.to_string(),
        },
    }
}

// =============================================================================
// Address Pool
// =============================================================================

/// Per-container address allocation backed by lease files.
#[derive(Debug, Clone)]
pub struct AddressPool {
    dir: PathBuf,
    config: NetworkConfig,
}

/// An allocated address. Released explicitly by [`Lease::release`].
#[derive(Debug)]
pub struct Lease {
    address: Ipv4Addr,
    path: PathBuf,
}

impl Lease {
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the lease file.
    pub fn release(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(address = %self.address, "lease released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::NetworkSetup {
                step: "release address".to_string(),
                reason: format!("{}: {}", self.path.display(), e),
            }),
        }
    }
}

impl AddressPool {
    /// Opens the pool, creating the lease directory if needed.
    pub fn new(dir: impl Into<PathBuf>, config: &NetworkConfig) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| lease_dir_error(&dir, e))?;
        Ok(Self {
            dir,
            config: config.clone(),
        })
    }

    /// Allocates an address for `identity`, probing from its pool offset.
    ///
    /// # Errors
    ///
    /// [`Error::NetworkSetup`] when every address in the range is leased.
    pub fn allocate(&self, identity: &ContainerIdentity) -> Result<Lease> {
        let start = u32::from(self.config.host_range_start);
        let end = u32::from(self.config.host_range_end);
        let span = end - start + 1;
        let offset = identity.pool_offset() % span;
        let gateway = self.config.gateway.octets()[3];

        for i in 0..span {
            let octet = (start + (offset + i) % span) as u8;
            if octet == gateway {
                continue;
            }
            let address = self.config.host_address(octet);
            if let Some(lease) = self.try_claim(address, identity)? {
                info!(container = %identity, address = %address, "address leased");
                return Ok(lease);
            }
        }

        Err(Error::NetworkSetup {
            step: "allocate address".to_string(),
            reason: format!(
                "no free address in {}..={}",
                self.config.host_address(self.config.host_range_start),
                self.config.host_address(self.config.host_range_end)
            ),
        })
    }

    fn try_claim(&self, address: Ipv4Addr, identity: &ContainerIdentity) -> Result<Option<Lease>> {
        let _pool = self.lock()?;
        let path = self.dir.join(address.to_string());

        if fs::symlink_metadata(&path).is_ok() {
            if !lease_is_stale(&path) {
                return Ok(None);
            }
            debug!(address = %address, "reclaiming stale lease");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(lease_dir_error(&path, e)),
            }
        }

        let scratch = self
            .dir
            .join(format!(".{}.{}", address, uuid::Uuid::now_v7()));
        let published = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&scratch)?;
            writeln!(file, "{}\n{}", std::process::id(), identity)?;
            file.sync_all()?;
            fs::hard_link(&scratch, &path)
        })();
        if let Err(e) = fs::remove_file(&scratch)
            && e.kind() != ErrorKind::NotFound
        {
            debug!(path = %scratch.display(), error = %e, "scratch lease not removed");
        }

        match published {
            Ok(()) => Ok(Some(Lease { address, path })),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(lease_dir_error(&path, e)),
        }
    }

    /// Exclusive lock over the lease directory, released on drop.
    fn lock(&self) -> Result<Flock<File>> {
        let path = self.dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| lease_dir_error(&path, e))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| lease_dir_error(&path, std::io::Error::from(errno)))
    }
}

/// A lease is stale when its owner is no longer running. A lease without a
/// readable PID is only stale once it is older than [`LEASE_GRACE_PERIOD`].
fn lease_is_stale(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    match contents.lines().next().and_then(|l| l.trim().parse::<i32>().ok()) {
        Some(pid) if pid > 0 => !process_alive(pid),
        _ => fs::symlink_metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > LEASE_GRACE_PERIOD),
    }
}

fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn lease_dir_error(path: &Path, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::PermissionDenied {
        Error::Permission {
            operation: "address lease".to_string(),
            reason: format!("{}: {}", path.display(), e),
        }
    } else {
        Error::NetworkSetup {
            step: "address lease".to_string(),
            reason: format!("{}: {}", path.display(), e),
        }
    }
}
