//! Error types for image acquisition and container launch.

use crate::constants::{EXIT_CANNOT_EXECUTE, EXIT_NOT_FOUND, EXIT_RUNTIME_ERROR};
use std::path::PathBuf;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pulling, storing or running images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Token request rejected or token payload malformed.
    #[error("authentication failed for '{scope}': {reason}")]
    Auth {
        scope: String,
        status: Option<u16>,
        reason: String,
    },

    /// Registry answered 404 for the manifest.
    #[error("manifest not found: {image}:{tag}")]
    ManifestNotFound { image: String, tag: String },

    /// Registry answered with an unexpected status or was unreachable.
    #[error("registry error: {reason}")]
    Registry { status: Option<u16>, reason: String },

    /// Manifest or runtime config body is not the expected JSON.
    #[error("failed to decode {what}: {reason}")]
    Decode { what: String, reason: String },

    /// Layer download failed or was cut short.
    #[error("failed to fetch layer {digest}: {reason}")]
    LayerFetch {
        digest: String,
        status: Option<u16>,
        reason: String,
    },

    /// Malformed image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Store Errors
    // =========================================================================
    /// Filesystem failure inside the image store.
    #[error("store I/O error at {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisted manifest is not valid JSON.
    #[error("corrupt image record {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    /// Image absent from the local store.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Layer archive could not be unpacked.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Archive entry escapes the content root.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Layer or extracted content exceeds its ceiling.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    // =========================================================================
    // Isolation Errors
    // =========================================================================
    /// veth, bridge, namespace or address setup failed.
    #[error("network setup failed at {step}: {reason}")]
    NetworkSetup { step: String, reason: String },

    /// Caller lacks the privilege for a namespace, cgroup or chroot operation.
    #[error("permission denied for {operation}: {reason}")]
    Permission { operation: String, reason: String },

    /// Control group creation or configuration failed.
    #[error("resource limit error: {0}")]
    ResourceLimit(String),

    /// Isolation could not be applied to the process before it ran.
    #[error("container setup failed for '{id}': {reason}")]
    ContainerSetup { id: String, reason: String },

    /// Target program could not be started.
    #[error("failed to launch '{command}': {reason}")]
    ProcessLaunch {
        command: String,
        not_found: bool,
        reason: String,
    },

    /// Operator interrupted the operation with a signal.
    #[error("cancelled by {0}")]
    Cancelled(String),

    // =========================================================================
    // Configuration / Generic
    // =========================================================================
    /// Configuration file unreadable or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wraps an I/O error with the store path it happened at.
    pub fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StoreIo {
            path: path.into(),
            source,
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    ///
    /// Transport failures and truncated streams carry no status; 408, 429
    /// and 5xx are the transient statuses. A malformed body keeps the 2xx
    /// status it arrived with and is therefore final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Registry { status, .. }
            | Self::Auth { status, .. }
            | Self::LayerFetch { status, .. } => status.is_none_or(is_transient_status),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Maps the error onto a process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ProcessLaunch {
                not_found: true, ..
            } => EXIT_NOT_FOUND,
            Self::ProcessLaunch { .. } => EXIT_CANNOT_EXECUTE,
            _ => EXIT_RUNTIME_ERROR,
        }
    }
}

fn is_transient_status(code: u16) -> bool {
    code == 408 || code == 429 || (500..600).contains(&code)
}
