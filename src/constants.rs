//! # Runtime Constants
//!
//! Defaults, limits and naming conventions shared by the image store, the
//! registry client and the isolation layer. [`crate::config::Config`] starts
//! from these values; anything an operator may want to change is also a
//! config field.
//!
//! ## Cross-References
//!
//! - [`crate::registry`]: endpoints, timeouts and retry defaults
//! - [`crate::storage`]: on-disk layout and extraction bounds
//! - [`crate::network`]: bridge, subnet and interface naming
//! - [`crate::cgroup`]: default CPU and memory ceilings

use std::time::Duration;

// =============================================================================
// Registry
// =============================================================================

/// Default registry API base (v2 protocol root).
pub const DEFAULT_REGISTRY_URL: &str = "https://registry-1.docker.io/v2";

/// Default token endpoint.
pub const DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";

/// Service name sent with token requests.
pub const DEFAULT_AUTH_SERVICE: &str = "registry.docker.io";

/// Library (namespace) used when a reference names only the image.
pub const DEFAULT_LIBRARY: &str = "library";

/// Tag used when a reference carries none.
pub const DEFAULT_TAG: &str = "latest";

/// Media types accepted for manifest requests.
///
/// The store persists the schema-1 layout (`fsLayers` + `history`), which
/// is the only format carrying the `v1Compatibility` runtime config inline.
pub const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws, \
     application/vnd.docker.distribution.manifest.v1+json, application/json";

/// Deadline for token and manifest requests, and the idle limit while a
/// layer body streams.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of retries for a transiently failing registry request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential retry backoff.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on a single backoff sleep.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Default number of layer downloads in flight during a pull.
pub const DEFAULT_PULL_CONCURRENCY: usize = 3;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum image reference length in bytes.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum manifest body size (1 MiB).
///
/// Schema-1 manifests carry one history entry per layer; 1 MiB leaves
/// plenty of room while bounding memory during decoding.
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Default ceiling for a single downloaded layer archive (2 GiB).
pub const DEFAULT_MAX_LAYER_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Maximum total extracted content per image (16 GiB).
///
/// Enforced while unpacking, accumulated across all layers of one pull.
/// Bounds decompression bombs.
pub const MAX_ROOTFS_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Maximum number of layers in a manifest.
pub const MAX_LAYERS: usize = 128;

// =============================================================================
// Store Layout
// =============================================================================
//
// <base_dir>/
// ├── library_hello.json            manifest, verbatim from the registry
// └── library_hello/
//     └── layers/
//         ├── sha256:abcd....tar    downloaded layer archives
//         └── contents/             unioned extracted filesystem
// =============================================================================

/// Directory name of the default store under the user's home.
pub const STORE_DIR_NAME: &str = "mocker";

/// Per-image subdirectory holding archives and extracted content.
pub const LAYERS_DIR: &str = "layers";

/// Extracted content root under [`LAYERS_DIR`].
pub const CONTENTS_DIR: &str = "contents";

/// Manifest file extension.
pub const MANIFEST_EXT: &str = "json";

/// Layer archive file extension.
pub const LAYER_ARCHIVE_EXT: &str = "tar";

/// Default directory for runtime state (address leases).
pub const DEFAULT_STATE_DIR: &str = "/run/mocker";

/// Lease subdirectory under the state directory.
pub const LEASES_DIR: &str = "leases";

/// Age below which a lease without a readable owner PID counts as held.
pub const LEASE_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Default search path for images that do not define `PATH`.
pub const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

// =============================================================================
// Network
// =============================================================================

/// Bridge shared by all containers on the host.
pub const DEFAULT_BRIDGE: &str = "bridge0";

/// Container subnet network address.
pub const DEFAULT_SUBNET: [u8; 4] = [10, 0, 0, 0];

/// Container subnet prefix length.
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Gateway address, assigned to the bridge.
pub const DEFAULT_GATEWAY: [u8; 4] = [10, 0, 0, 1];

/// First allocatable host octet.
pub const DEFAULT_HOST_RANGE_START: u8 = 2;

/// Last allocatable host octet.
pub const DEFAULT_HOST_RANGE_END: u8 = 254;

/// Locally administered MAC prefix; the last octet comes from the identity.
pub const DEFAULT_MAC_PREFIX: &str = "02:42:ac:11:00";

/// Directory where `ip netns` keeps named namespaces.
pub const DEFAULT_NETNS_DIR: &str = "/run/netns";

/// Prefix of the host-side veth.
pub const VETH_HOST_PREFIX: &str = "veth0_";

/// Prefix of the namespace-side veth.
pub const VETH_PEER_PREFIX: &str = "veth1_";

/// Prefix of the network namespace name.
pub const NETNS_PREFIX: &str = "netns_";

/// Prefix of the container short name.
pub const CONTAINER_NAME_PREFIX: &str = "c_";

/// Kernel limit on interface names (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

// =============================================================================
// Resource Limits
// =============================================================================

/// Default cgroup filesystem mount point.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default CPU ceiling in percent of one CPU.
pub const DEFAULT_CPU_PERCENT: u32 = 50;

/// Default memory ceiling in MiB.
pub const DEFAULT_MEMORY_MB: u64 = 500;

/// CFS period used to express CPU percentages as `cpu.max` quotas.
pub const CPU_PERIOD_US: u64 = 100_000;

/// cgroup v1 share weight of one full CPU.
pub const CPU_SHARES_PER_CPU: u64 = 1024;

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit code for runtime and setup failures.
pub const EXIT_RUNTIME_ERROR: u8 = 125;

/// Exit code when the target program exists but cannot be executed.
pub const EXIT_CANNOT_EXECUTE: u8 = 126;

/// Exit code when the target program does not exist.
pub const EXIT_NOT_FOUND: u8 = 127;

// =============================================================================
// Validation Patterns
// =============================================================================

/// Valid characters for image references (`library/image:tag`).
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:";

/// Valid characters for a layer digest (`sha256:<hex>`).
pub const DIGEST_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789:+-._";

/// Validates an image reference before it reaches a URL or a path.
///
/// # Returns
///
/// `Ok(())` if valid, `Err(reason)` with a description of the failure.
#[must_use = "validation result must be checked before the reference is used"]
pub fn validate_image_ref(reference: &str) -> std::result::Result<(), &'static str> {
    if reference.is_empty() {
        return Err("image reference cannot be empty");
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err("image reference exceeds maximum length");
    }
    if !reference.chars().all(|c| IMAGE_REF_VALID_CHARS.contains(c)) {
        return Err("image reference contains invalid characters");
    }
    if reference.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err("image reference contains an empty or relative path segment");
    }
    Ok(())
}

/// Validates a layer digest before it is used as a file name.
#[must_use = "validation result must be checked before the digest is used"]
pub fn validate_digest(digest: &str) -> std::result::Result<(), &'static str> {
    let Some((algo, hash)) = digest.split_once(':') else {
        return Err("digest must have the form <algorithm>:<hex>");
    };
    if algo.is_empty() || hash.is_empty() {
        return Err("digest algorithm and hash must be non-empty");
    }
    if !digest.chars().all(|c| DIGEST_VALID_CHARS.contains(c)) {
        return Err("digest contains invalid characters");
    }
    if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("digest hash must be hexadecimal");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_image_ref() {
        assert!(validate_image_ref("hello").is_ok());
        assert!(validate_image_ref("library/hello:latest").is_ok());
        assert!(validate_image_ref("").is_err());
        assert!(validate_image_ref("a/../b").is_err());
        assert!(validate_image_ref("/hello").is_err());
        assert!(validate_image_ref("hello world").is_err());
        assert!(validate_image_ref(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_digest() {
        assert!(validate_digest("sha256:abcdef0123").is_ok());
        assert!(validate_digest("abcdef").is_err());
        assert!(validate_digest("sha256:").is_err());
        assert!(validate_digest("sha256:../../etc").is_err());
        assert!(validate_digest("sha256:xyz").is_err());
    }

    #[test]
    fn test_interface_names_fit_kernel_limit() {
        // prefix + "c_" + 6 hex chars
        let longest = VETH_HOST_PREFIX.len().max(VETH_PEER_PREFIX.len()) + CONTAINER_NAME_PREFIX.len() + 6;
        assert!(longest <= MAX_IFNAME_LEN);
    }
}
