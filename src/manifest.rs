//! # Image References and Manifests
//!
//! Parses image references (`hello`, `library/hello`, `user/app:1.0`) and
//! the registry's schema-1 manifest (`fsLayers` + `history`).
//!
//! ## Layer Order
//!
//! The wire format lists `fsLayers` top-most first. [`ImageManifest::layers`]
//! is kept in application order (base layer first), which is the order the
//! store extracts in. A digest may appear several times on the wire; see
//! [`ImageManifest::unique_layers`].
//!
//! ## Runtime Configuration
//!
//! `history[0].v1Compatibility` is a JSON document encoded as a string. Its
//! `config` block (or `container_config` when `config` is absent) carries
//! `Env`, `Cmd`, `Entrypoint` and `WorkingDir`.

use crate::constants::{
    DEFAULT_LIBRARY, DEFAULT_PATH_ENV, DEFAULT_TAG, MAX_LAYERS, MAX_MANIFEST_SIZE,
    validate_digest, validate_image_ref,
};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

// =============================================================================
// Image Reference
// =============================================================================

/// A validated `library/image:tag` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub library: String,
    pub image: String,
    pub tag: String,
}

impl ImageRef {
    /// Parses a reference using the default library.
    pub fn parse(reference: &str) -> Result<Self> {
        Self::parse_in(reference, DEFAULT_LIBRARY)
    }

    /// Parses a reference, placing bare image names in `library`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidImageReference`] when the reference fails validation
    /// or has more than two path segments.
    pub fn parse_in(reference: &str, library: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        validate_image_ref(reference).map_err(invalid)?;

        // A ':' after the last '/' separates the tag.
        let name_end = reference.rfind('/').map_or(0, |i| i + 1);
        let (path, tag) = match reference[name_end..].rfind(':') {
            Some(i) => {
                let split = name_end + i;
                (&reference[..split], &reference[split + 1..])
            }
            None => (reference, DEFAULT_TAG),
        };
        if tag.is_empty() || tag.contains(':') {
            return Err(invalid("tag must be non-empty"));
        }
        if path.contains(':') {
            return Err(invalid("registry hosts and ports are not supported"));
        }

        let (library, image) = match path.split_once('/') {
            Some((lib, img)) if !img.contains('/') => (lib, img),
            Some(_) => return Err(invalid("expected at most one '/' separator")),
            None => (library, path),
        };
        if image.is_empty() {
            return Err(invalid("image name must be non-empty"));
        }

        Ok(Self {
            library: library.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
        })
    }

    /// Returns the same repository with a different tag.
    pub fn with_tag(mut self, tag: &str) -> Result<Self> {
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c)) {
            return Err(Error::InvalidImageReference {
                reference: format!("{}:{}", self.repository(), tag),
                reason: "tag contains invalid characters".to_string(),
            });
        }
        self.tag = tag.to_string();
        Ok(self)
    }

    /// `library/image`, the registry repository path.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.library, self.image)
    }

    /// File-system-safe key for the local store (`library_image`).
    pub fn store_key(&self) -> String {
        store_key_for(&self.repository())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.library, self.image, self.tag)
    }
}

/// Maps a repository name onto a store key.
pub fn store_key_for(repository: &str) -> String {
    repository.replace('/', "_")
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Process settings embedded in the image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// `K=V` entries.
    pub env: Vec<String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    /// Absolute path inside the content root, if set.
    pub working_dir: Option<String>,
}

impl RuntimeConfig {
    /// Command line to execute: entrypoint followed by `cmd`, or by the
    /// caller's override when one is given.
    pub fn argv(&self, command_override: Option<&[String]>) -> Vec<String> {
        let tail = match command_override {
            Some(cmd) if !cmd.is_empty() => cmd,
            _ => &self.cmd,
        };
        self.entrypoint.iter().chain(tail.iter()).cloned().collect()
    }

    /// Image environment with a default `PATH` when the image sets none.
    pub fn environment(&self) -> Vec<String> {
        let mut env = self.env.clone();
        if !env.iter().any(|kv| kv.starts_with("PATH=")) {
            env.push(DEFAULT_PATH_ENV.to_string());
        }
        env
    }

    /// Splits the environment into key/value pairs, skipping malformed entries.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.environment()
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .filter(|(k, _)| !k.is_empty())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// An image manifest as fetched from the registry.
#[derive(Debug, Clone)]
pub struct ImageManifest {
    /// Repository name (`library/hello`).
    pub name: String,
    pub tag: String,
    /// Layer digests in application order, base first. May repeat.
    pub layers: Vec<String>,
    pub runtime_config: RuntimeConfig,
    /// Body exactly as the registry returned it.
    pub raw: String,
}

#[derive(Deserialize)]
struct WireManifest {
    name: Option<String>,
    tag: Option<String>,
    #[serde(rename = "fsLayers", default)]
    fs_layers: Vec<WireLayer>,
    #[serde(default)]
    history: Vec<WireHistory>,
}

#[derive(Deserialize)]
struct WireLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Deserialize)]
struct WireHistory {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Deserialize, Default)]
struct V1Compat {
    config: Option<V1Config>,
    container_config: Option<V1Config>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct V1Config {
    env: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    working_dir: Option<String>,
}

impl ImageManifest {
    /// Decodes a registry manifest body.
    ///
    /// `name` is always `reference`'s repository; `tag` falls back to
    /// `reference` when the body omits it.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] on malformed JSON, a body naming another repository, a missing or malformed
    /// compatibility block, invalid digests, or too many layers.
    pub fn from_registry_json(raw: &str, reference: &ImageRef) -> Result<Self> {
        let decode = |reason: String| Error::Decode {
            what: format!("manifest for {}", reference),
            reason,
        };

        if raw.len() > MAX_MANIFEST_SIZE {
            return Err(decode(format!(
                "manifest is {} bytes, limit is {}",
                raw.len(),
                MAX_MANIFEST_SIZE
            )));
        }

        let wire: WireManifest = serde_json::from_str(raw).map_err(|e| decode(e.to_string()))?;

        if wire.fs_layers.len() > MAX_LAYERS {
            return Err(decode(format!(
                "{} layers exceeds the limit of {}",
                wire.fs_layers.len(),
                MAX_LAYERS
            )));
        }

        let mut layers = Vec::with_capacity(wire.fs_layers.len());
        for layer in wire.fs_layers.iter().rev() {
            validate_digest(&layer.blob_sum)
                .map_err(|reason| decode(format!("layer '{}': {}", layer.blob_sum, reason)))?;
            layers.push(layer.blob_sum.clone());
        }

        let runtime_config = match wire.history.first() {
            Some(entry) => parse_v1_compatibility(&entry.v1_compatibility).map_err(decode)?,
            None => RuntimeConfig::default(),
        };

        let name = reference.repository();
        if let Some(wire_name) = &wire.name
            && *wire_name != name
        {
            return Err(decode(format!("body names repository '{}'", wire_name)));
        }

        Ok(Self {
            name,
            tag: wire.tag.unwrap_or_else(|| reference.tag.clone()),
            layers,
            runtime_config,
            raw: raw.to_string(),
        })
    }

    /// Layer digests to fetch and extract, each once, in application order.
    ///
    /// A repeated digest keeps its last position: re-applying a layer on
    /// top would have overwritten everything layered between.
    pub fn unique_layers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut unique: Vec<String> = self
            .layers
            .iter()
            .rev()
            .filter(|d| seen.insert(d.as_str()))
            .cloned()
            .collect();
        unique.reverse();
        unique
    }

    /// Store key derived from the manifest name.
    pub fn store_key(&self) -> String {
        store_key_for(&self.name)
    }
}

fn parse_v1_compatibility(raw: &str) -> std::result::Result<RuntimeConfig, String> {
    let compat: V1Compat =
        serde_json::from_str(raw).map_err(|e| format!("v1Compatibility: {}", e))?;
    let config = compat.config.or(compat.container_config).unwrap_or_default();
    Ok(RuntimeConfig {
        env: config.env.unwrap_or_default(),
        entrypoint: config.entrypoint.unwrap_or_default(),
        cmd: config.cmd.unwrap_or_default(),
        working_dir: config.working_dir.filter(|d| !d.is_empty()),
    })
}
