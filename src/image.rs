//! # Image Service
//!
//! Pulls images into the local store and answers listing queries.
//!
//! ## Pull Pipeline
//!
//! ```text
//! authenticate ─► fetch manifest ─► dedup layers ─► download (≤ N in flight)
//!                                                        │ in manifest order
//!                                                        ▼
//!                                   extract into staging ─► commit (swap + manifest)
//! ```
//!
//! Downloads run concurrently up to `pull_concurrency`, but results are
//! consumed strictly in application order so that later layers overwrite
//! earlier ones. Each download attempt writes a fresh partial archive; a
//! transient failure restarts the layer from scratch.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::{ImageManifest, ImageRef};
use crate::registry::RegistryClient;
use crate::storage::{ImageRecord, ImageStore};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use tracing::{debug, info};

/// One layer to download: digest, scratch path, final archive path.
struct LayerJob {
    digest: String,
    partial: PathBuf,
    archive: PathBuf,
}

/// Pull, lookup and listing of images.
#[derive(Debug, Clone)]
pub struct ImageService {
    store: ImageStore,
    registry: RegistryClient,
    library: String,
    concurrency: usize,
}

impl ImageService {
    /// Builds the store and registry client from configuration.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            store: ImageStore::new(config)?,
            registry: RegistryClient::new(&config.registry)?,
            library: config.registry.library.clone(),
            concurrency: config.registry.pull_concurrency.max(1),
        })
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Parses `name`, overriding its tag when `tag` is given.
    pub fn parse_reference(&self, name: &str, tag: Option<&str>) -> Result<ImageRef> {
        let reference = ImageRef::parse_in(name, &self.library)?;
        match tag {
            Some(tag) => reference.with_tag(tag),
            None => Ok(reference),
        }
    }

    /// Returns the stored manifest for `reference`, pulling on a miss.
    ///
    /// A record for the same repository under a different tag counts as a
    /// miss and is replaced.
    pub async fn ensure(&self, reference: &ImageRef) -> Result<ImageManifest> {
        if self.store.has(&reference.repository()) {
            let manifest = self.store.load(reference)?;
            if manifest.tag == reference.tag {
                debug!(image = %reference, "image present locally");
                return Ok(manifest);
            }
            info!(
                image = %reference,
                stored_tag = %manifest.tag,
                "stored record has a different tag, pulling"
            );
        }
        self.pull(reference).await
    }

    /// Pulls `reference` from the registry, replacing any stored record.
    ///
    /// # Errors
    ///
    /// Registry errors ([`Error::Auth`], [`Error::ManifestNotFound`],
    /// [`Error::Registry`], [`Error::Decode`], [`Error::LayerFetch`]) and
    /// store errors propagate unchanged. The live record is untouched on
    /// failure.
    pub async fn pull(&self, reference: &ImageRef) -> Result<ImageManifest> {
        let repository = reference.repository();
        info!(image = %reference, "pulling image");

        let token = self.registry.authenticate(&repository).await?;
        let manifest = self.registry.fetch_manifest(reference, &token).await?;
        let layers = manifest.unique_layers();
        info!(
            image = %reference,
            layers = layers.len(),
            duplicates = manifest.layers.len() - layers.len(),
            "downloading layers"
        );

        let mut staged = self.store.begin_pull(&repository)?;
        let jobs = layers
            .into_iter()
            .map(|digest| {
                Ok(LayerJob {
                    partial: staged.partial_archive_path(&digest)?,
                    archive: staged.archive_path(&digest)?,
                    digest,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut downloads = stream::iter(jobs)
            .map(|job| self.download_layer(reference, &token, job))
            .buffered(self.concurrency);

        while let Some(downloaded) = downloads.next().await {
            let digest = downloaded?;
            staged = tokio::task::spawn_blocking(move || {
                staged.extract(&digest)?;
                Ok::<_, Error>(staged)
            })
            .await
            .map_err(|e| Error::Internal(format!("extraction task failed: {}", e)))??;
        }

        staged.commit(&manifest)?;
        info!(image = %reference, "pull complete");
        Ok(manifest)
    }

    async fn download_layer(&self, reference: &ImageRef, token: &str, job: LayerJob) -> Result<String> {
        let partial = job.partial.as_path();
        let digest = job.digest.as_str();

        let bytes = self
            .registry
            .retry_policy()
            .run("fetch layer", || async move {
                let mut file = tokio::fs::File::create(partial)
                    .await
                    .map_err(|e| Error::store_io(partial, e))?;
                let written = self.registry.fetch_layer(reference, digest, token, &mut file).await?;
                file.sync_all().await.map_err(|e| Error::store_io(partial, e))?;
                Ok(written)
            })
            .await
            .inspect_err(|_| {
                let _ = std::fs::remove_file(partial);
            })?;

        tokio::fs::rename(partial, &job.archive)
            .await
            .map_err(|e| Error::store_io(&job.archive, e))?;

        debug!(image = %reference, digest, bytes, "layer stored");
        Ok(job.digest)
    }

    /// Lists stored images.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        self.store.list()
    }
}

/// Formats a byte count with binary units, one decimal (`1.5KiB`).
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 8] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value.abs() < 1024.0 {
            return format!("{:3.1}{}B", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1}YiB", value)
}
