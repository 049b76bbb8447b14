//! # Container Launcher
//!
//! Runs one image as an isolated process:
//!
//! 1. Resolve the image, pulling it on a miss
//! 2. Read entrypoint, command, environment and working directory
//! 3. Generate a [`ContainerIdentity`]
//! 4. Lease an address and build the [`NetworkEnvironment`]
//! 5. Create the control group with the requested limits
//! 6. Spawn the process inside namespace, cgroup and chroot
//! 7. Wait for it, collecting output when requested
//! 8. Tear down in reverse order on every path
//!
//! Every resource is recorded in a [`TeardownStack`] the moment it exists.
//! The stack runs once after the process exits or a step fails, and from
//! its `Drop` if the launch future itself is dropped. Network setup and the
//! teardown run on the blocking pool, since both wait on `ip` processes.
//!
//! SIGINT and SIGTERM are intercepted for the duration of a launch. During
//! a pull they cancel it; while the container runs they kill it, and the
//! launch then completes normally with teardown.

use crate::cgroup::ResourceLimiter;
use crate::config::{Config, ResourceLimits};
use crate::error::{Error, Result};
use crate::identity::ContainerIdentity;
use crate::image::ImageService;
use crate::manifest::{ImageManifest, ImageRef};
use crate::network::{AddressPool, IpRoute2, LinkControl, NetworkEnvironment};
use crate::runtime::ExecutionContext;
use crate::teardown::{TeardownReport, TeardownStack};
use std::net::Ipv4Addr;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{error, info, warn};

/// What to run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub image: ImageRef,
    /// Replaces the image's `Cmd` when set.
    pub command: Option<Vec<String>>,
    /// Falls back to the configured limits when unset.
    pub limits: Option<ResourceLimits>,
    /// Pipe stdout/stderr into the outcome instead of inheriting them.
    pub capture_output: bool,
}

impl LaunchRequest {
    pub fn new(image: ImageRef) -> Self {
        Self {
            image,
            command: None,
            limits: None,
            capture_output: false,
        }
    }
}

/// Result of a completed launch.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    /// Container short name.
    pub container: String,
    pub address: Ipv4Addr,
    /// Process exit code (128 + signal when killed).
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Signal that stopped the container, if the operator interrupted it.
    pub cancelled_by: Option<String>,
    pub teardown: TeardownReport,
}

/// Orchestrates image resolution, isolation and execution.
pub struct ContainerLauncher {
    config: Config,
    images: ImageService,
    links: Arc<dyn LinkControl>,
    limiter: ResourceLimiter,
    pool: AddressPool,
}

impl ContainerLauncher {
    /// Builds a launcher driving the host's `ip` and cgroup filesystem.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_parts(
            config,
            ImageService::new(config)?,
            Arc::new(IpRoute2::new()),
            ResourceLimiter::new(&config.cgroup)?,
            AddressPool::new(config.leases_dir(), &config.network)?,
        ))
    }

    /// Assembles a launcher from explicit components.
    pub fn with_parts(
        config: &Config,
        images: ImageService,
        links: Arc<dyn LinkControl>,
        limiter: ResourceLimiter,
        pool: AddressPool,
    ) -> Self {
        Self {
            config: config.clone(),
            images,
            links,
            limiter,
            pool,
        }
    }

    pub fn images(&self) -> &ImageService {
        &self.images
    }

    /// Runs `request` to completion.
    ///
    /// A non-zero exit of the container is a normal outcome. Errors mean
    /// the container never ran (or could not be waited for); whatever was
    /// set up has been torn down by the time they are returned.
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchOutcome> {
        let mut shutdown = Shutdown::install();

        let manifest = tokio::select! {
            manifest = self.images.ensure(&request.image) => manifest?,
            sig = shutdown.recv() => {
                warn!(image = %request.image, signal = sig, "pull interrupted");
                return Err(Error::Cancelled(sig.to_string()));
            }
        };

        let identity = ContainerIdentity::generate();
        info!(container = %identity, image = %request.image, "launching container");

        let mut ledger = TeardownStack::new();
        let result = self
            .run(&identity, &manifest, &request, &mut ledger, &mut shutdown)
            .await;
        let report = unwind(ledger).await;

        match result {
            Ok(mut outcome) => {
                outcome.teardown = report;
                info!(container = %identity, exit_code = outcome.exit_code, "container finished");
                Ok(outcome)
            }
            Err(e) => {
                error!(container = %identity, error = %e, "launch failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        identity: &ContainerIdentity,
        manifest: &ImageManifest,
        request: &LaunchRequest,
        ledger: &mut TeardownStack,
        shutdown: &mut Shutdown,
    ) -> Result<LaunchOutcome> {
        let runtime = &manifest.runtime_config;
        let argv = runtime.argv(request.command.as_deref());
        if argv.is_empty() {
            return Err(Error::ProcessLaunch {
                command: String::new(),
                not_found: true,
                reason: format!("{} defines no command and none was given", manifest.name),
            });
        }

        let root = self.images.store().content_root(&request.image.repository());
        if !root.is_dir() {
            return Err(Error::ImageNotFound(format!(
                "{} (content root {} missing)",
                manifest.name,
                root.display()
            )));
        }
        let working_dir = prepare_working_dir(identity, &root, runtime.working_dir.as_deref())?;
        let limits = request.limits.unwrap_or(self.config.limits);
        limits.validate()?;

        // Address
        let lease = self.pool.allocate(identity)?;
        let address = lease.address();
        ledger.push("address lease", move || lease.release());

        // Network
        let network = Arc::new(Mutex::new(NetworkEnvironment::new(
            Arc::clone(&self.links),
            &self.config.network,
            identity,
            address,
        )));
        ledger.push("network", {
            let network = Arc::clone(&network);
            move || lock(&network).teardown()
        });
        let netns_path = tokio::task::spawn_blocking({
            let network = Arc::clone(&network);
            move || {
                let mut env = lock(&network);
                env.setup()?;
                Ok::<_, Error>(env.netns_path())
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("network setup task failed: {}", e)))??;

        // Resource limits
        let cgroup = self.limiter.apply(identity, &limits)?;
        ledger.push("cgroup", {
            let limiter = self.limiter.clone();
            let cgroup = cgroup.clone();
            move || limiter.release(&cgroup)
        });

        // Process
        let context = ExecutionContext {
            id: identity.short_name(),
            argv,
            env: runtime.env_pairs(),
            root,
            working_dir,
            netns: Some(netns_path),
            cgroup_procs: cgroup.procs_files(),
            capture_output: request.capture_output,
        };
        let mut process = context.spawn()?;

        let mut cancelled_by = None;
        let exit_code = tokio::select! {
            code = process.wait() => code?,
            sig = shutdown.recv() => {
                warn!(container = %identity, signal = sig, pid = process.pid(), "stopping container");
                cancelled_by = Some(sig.to_string());
                process.kill()?;
                process.wait().await?
            }
        };
        let (stdout, stderr) = process.collect_output().await;

        Ok(LaunchOutcome {
            container: identity.short_name(),
            address,
            exit_code,
            stdout,
            stderr,
            cancelled_by,
            teardown: TeardownReport::default(),
        })
    }
}

/// Runs the teardown stack on the blocking pool.
async fn unwind(mut ledger: TeardownStack) -> TeardownReport {
    match tokio::task::spawn_blocking(move || ledger.run()).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "teardown task failed");
            TeardownReport {
                released: Vec::new(),
                failed: vec![("teardown".to_string(), e.to_string())],
            }
        }
    }
}

fn lock(network: &Mutex<NetworkEnvironment>) -> std::sync::MutexGuard<'_, NetworkEnvironment> {
    network.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates the working directory inside `root` and returns it as an
/// absolute in-root path.
fn prepare_working_dir(
    identity: &ContainerIdentity,
    root: &Path,
    working_dir: Option<&str>,
) -> Result<Option<String>> {
    let Some(dir) = working_dir else {
        return Ok(None);
    };

    let relative = Path::new(dir.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::ContainerSetup {
            id: identity.short_name(),
            reason: format!("working directory '{}' escapes the content root", dir),
        });
    }

    let host_path: PathBuf = root.join(relative);
    std::fs::create_dir_all(&host_path).map_err(|e| Error::ContainerSetup {
        id: identity.short_name(),
        reason: format!("cannot create working directory {}: {}", host_path.display(), e),
    })?;
    Ok(Some(format!("/{}", relative.display())))
}

/// SIGINT/SIGTERM listener for the duration of one launch.
struct Shutdown {
    interrupt: Option<Signal>,
    terminate: Option<Signal>,
}

impl Shutdown {
    fn install() -> Self {
        let register = |kind: SignalKind, name: &str| match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(signal = name, error = %e, "cannot listen for signal");
                None
            }
        };
        Self {
            interrupt: register(SignalKind::interrupt(), "SIGINT"),
            terminate: register(SignalKind::terminate(), "SIGTERM"),
        }
    }

    /// Resolves with the name of the first signal received.
    async fn recv(&mut self) -> &'static str {
        match (&mut self.interrupt, &mut self.terminate) {
            (Some(int), Some(term)) => tokio::select! {
                _ = int.recv() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            (Some(int), None) => {
                int.recv().await;
                "SIGINT"
            }
            (None, Some(term)) => {
                term.recv().await;
                "SIGTERM"
            }
            (None, None) => std::future::pending().await,
        }
    }
}
