//! Container identity.
//!
//! A fresh UUIDv7 is hashed with SHA-256; the hex digest supplies the short
//! name used for the cgroup, veth pair and namespace (`c_<6 hex>`), the
//! last MAC octet and the starting offset into the address pool. Hashing
//! spreads the time-ordered UUID bits evenly over the derived values.

use crate::constants::{CONTAINER_NAME_PREFIX, NETNS_PREFIX, VETH_HOST_PREFIX, VETH_PEER_PREFIX};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Hex characters of the digest used in the short name.
const SHORT_HEX_LEN: usize = 6;

/// Unique identity of one container launch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerIdentity {
    uuid: Uuid,
    digest: String,
}

impl ContainerIdentity {
    /// Generates a new identity.
    pub fn generate() -> Self {
        Self::from_uuid(Uuid::now_v7())
    }

    /// Derives an identity from a known UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        let digest = hex::encode(Sha256::digest(uuid.as_bytes()));
        Self { uuid, digest }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// `c_` followed by six hex characters.
    pub fn short_name(&self) -> String {
        format!("{}{}", CONTAINER_NAME_PREFIX, &self.digest[..SHORT_HEX_LEN])
    }

    /// Two hex characters for the last MAC octet.
    pub fn mac_suffix(&self) -> &str {
        &self.digest[SHORT_HEX_LEN..SHORT_HEX_LEN + 2]
    }

    /// Full MAC address under `prefix` (five colon-separated octets).
    pub fn mac_address(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, self.mac_suffix())
    }

    /// Host-side veth name.
    pub fn veth_host(&self) -> String {
        format!("{}{}", VETH_HOST_PREFIX, self.short_name())
    }

    /// Namespace-side veth name.
    pub fn veth_peer(&self) -> String {
        format!("{}{}", VETH_PEER_PREFIX, self.short_name())
    }

    /// Network namespace name.
    pub fn netns_name(&self) -> String {
        format!("{}{}", NETNS_PREFIX, self.short_name())
    }

    /// Stable starting point for address allocation.
    pub fn pool_offset(&self) -> u32 {
        self.digest[8..16]
            .chars()
            .filter_map(|c| c.to_digit(16))
            .fold(0u32, |acc, d| acc.wrapping_mul(16).wrapping_add(d))
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name())
    }
}
