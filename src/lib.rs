//! # mocker
//!
//! **Minimal Linux Container Runtime**
//!
//! Pulls images from a Docker-compatible registry, keeps them in a local
//! store, and runs a command from an image inside its own network
//! namespace, control group and chroot.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                             mocker                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                    ContainerLauncher                        │    │
//! │  │  ensure image → identity → network → cgroup → spawn → wait  │    │
//! │  │            TeardownStack (reverse order, once)              │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │         │                 │                 │            │          │
//! │  ┌──────┴───────┐  ┌──────┴───────┐  ┌──────┴─────┐ ┌────┴──────┐   │
//! │  │ ImageService │  │ Network      │  │ Resource   │ │ Execution │   │
//! │  │ pull/ensure  │  │ Environment  │  │ Limiter    │ │ Context   │   │
//! │  └──────┬───────┘  │ veth+bridge  │  │ cgroup v1/ │ │ setns     │   │
//! │         │          │ netns, lease │  │ v2         │ │ chroot    │   │
//! │  ┌──────┴───────┐  └──────────────┘  └────────────┘ └───────────┘   │
//! │  │ Registry     │  token → manifest → layers (bounded parallel)     │
//! │  │ ImageStore   │  staged extraction, atomic replace                │
//! │  └──────────────┘                                                   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌──────────┐  setup   ┌────────────┐  spawn  ┌─────────┐
//!   │ (image)  │ ───────► │ Configured │ ──────► │ Running │
//!   └──────────┘          └─────┬──────┘         └────┬────┘
//!                               │ error               │ exit / signal
//!                               ▼                     ▼
//!                         ┌───────────────────────────────┐
//!                         │   Torn down (exactly once)    │
//!                         └───────────────────────────────┘
//! ```
//!
//! ## Key Safety Properties
//!
//! - **Path Traversal Protection**: layer extraction rejects `..` and
//!   absolute entries (see [`storage::unpack_layer`]).
//! - **Size Limits**: per-layer and per-image ceilings
//!   ([`DEFAULT_MAX_LAYER_BYTES`], [`MAX_ROOTFS_SIZE`]).
//! - **Atomic Replacement**: a re-pull never leaves a half-written record
//!   (see [`storage::StagedPull`]).
//! - **Guaranteed Teardown**: every host resource is released on every
//!   path (see [`teardown::TeardownStack`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use mocker::{Config, ContainerLauncher, LaunchRequest};
//!
//! #[tokio::main]
//! async fn main() -> mocker::Result<()> {
//!     let config = Config::load(None)?;
//!     let launcher = ContainerLauncher::new(&config)?;
//!     let image = launcher.images().parse_reference("hello-world", None)?;
//!     let outcome = launcher.launch(LaunchRequest::new(image)).await?;
//!     println!("exit code {}", outcome.exit_code);
//!     Ok(())
//! }
//! ```

pub mod cgroup;
pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod image;
pub mod launcher;
pub mod manifest;
pub mod network;
pub mod platform;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod teardown;

// Re-exports
pub use cgroup::{CgroupHandle, CgroupVersion, ResourceLimiter};
pub use config::{CgroupConfig, Config, NetworkConfig, RegistryConfig, ResourceLimits};
pub use constants::*;
pub use error::{Error, Result};
pub use identity::ContainerIdentity;
pub use image::{ImageService, format_size};
pub use launcher::{ContainerLauncher, LaunchOutcome, LaunchRequest};
pub use manifest::{ImageManifest, ImageRef, RuntimeConfig};
pub use network::{AddressPool, IpRoute2, Lease, LinkControl, LinkError, NetworkEnvironment, NetworkState};
pub use platform::{Arch, Capability, Platform};
pub use registry::{RegistryClient, RetryPolicy};
pub use runtime::{ContainerProcess, ExecutionContext, SetupStage};
pub use storage::{ImageRecord, ImageStore, StagedPull};
pub use teardown::{TeardownReport, TeardownStack};
