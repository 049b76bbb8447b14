//! # Local Image Store
//!
//! Persists manifests and layer archives and unpacks layers into a single
//! content root per image.
//!
//! ## Layout
//!
//! ```text
//! <base_dir>/
//! ├── library_hello.json                 manifest, verbatim from the registry
//! └── library_hello/
//!     └── layers/
//!         ├── sha256:aaaa....tar         layer archives
//!         ├── sha256:bbbb....tar
//!         └── contents/                  unioned extracted filesystem
//! ```
//!
//! Images are keyed by repository with `/` replaced by `_`. One record is
//! kept per repository; pulling another tag replaces it.
//!
//! ## Flat Union
//!
//! Layers are extracted one after the other into the same directory. A
//! later layer overwrites any path an earlier one wrote; whiteout entries
//! (`.wh.<name>`, `.wh..wh..opq`) delete earlier content. There is no
//! copy-on-write and no per-layer isolation.
//!
//! ## Atomicity
//!
//! Manifests are written to a uniquely named temp file and renamed into
//! place, so a reader sees either the old or the new record. A pull
//! assembles its layers in a staging directory ([`StagedPull`]), swaps the
//! finished `layers/` tree in, and only then renames the manifest.
//!
//! ## Extraction Bounds
//!
//! - Entries with `..` components or absolute paths fail with
//!   [`Error::PathTraversal`], as do entries and whiteouts whose parent
//!   resolves outside the content root through a symlink
//! - Cumulative extracted size per pull is capped at [`MAX_ROOTFS_SIZE`]
//! - Device nodes are skipped unless running as root

use crate::config::Config;
use crate::constants::{
    CONTENTS_DIR, LAYER_ARCHIVE_EXT, LAYERS_DIR, MANIFEST_EXT, MAX_ROOTFS_SIZE, validate_digest,
};
use crate::error::{Error, Result};
use crate::manifest::{ImageManifest, ImageRef, store_key_for};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";
const STAGING_PREFIX: &str = ".staging-";

/// One stored image as reported by [`ImageStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Repository name (`library/hello`).
    pub name: String,
    pub tag: String,
    /// Bytes of every regular file under the image's layer directory.
    pub size_bytes: u64,
    /// Manifest file path.
    pub record_path: PathBuf,
}

/// On-disk image store.
#[derive(Debug, Clone)]
pub struct ImageStore {
    base_dir: PathBuf,
}

impl ImageStore {
    /// Opens the store at the configured base directory.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_path(config.base_dir.clone())
    }

    /// Opens (creating if needed) a store rooted at `base_dir`.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| Error::store_io(&base_dir, e))?;
        debug!(path = %base_dir.display(), "image store opened");
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Manifest path for an image name (`library/hello` or `library_hello`).
    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}", store_key_for(name), MANIFEST_EXT))
    }

    fn image_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(store_key_for(name))
    }

    /// Directory holding an image's archives and content root.
    pub fn layer_dir(&self, name: &str) -> PathBuf {
        self.image_dir(name).join(LAYERS_DIR)
    }

    /// Directory to chroot into when running the image.
    pub fn content_root(&self, name: &str) -> PathBuf {
        self.layer_dir(name).join(CONTENTS_DIR)
    }

    /// True iff a manifest for `name` exists locally.
    pub fn has(&self, name: &str) -> bool {
        self.manifest_path(name).is_file()
    }

    /// Writes the manifest body, replacing any previous version atomically.
    pub fn save(&self, manifest: &ImageManifest) -> Result<PathBuf> {
        let path = self.manifest_path(&manifest.name);
        write_atomic(&path, manifest.raw.as_bytes())?;
        debug!(image = %manifest.name, tag = %manifest.tag, path = %path.display(), "manifest saved");
        Ok(path)
    }

    /// Loads the stored manifest for `reference`'s repository.
    ///
    /// # Errors
    ///
    /// - [`Error::ImageNotFound`] when no record exists
    /// - [`Error::CorruptRecord`] when the record cannot be decoded
    pub fn load(&self, reference: &ImageRef) -> Result<ImageManifest> {
        let path = self.manifest_path(&reference.repository());
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ImageNotFound(reference.repository()));
            }
            Err(e) => return Err(Error::store_io(&path, e)),
        };
        ImageManifest::from_registry_json(&raw, reference).map_err(|e| Error::CorruptRecord {
            path,
            reason: e.to_string(),
        })
    }

    /// Writes `stream` to the digest-named archive of `name`, then extracts
    /// it over the image's live content root.
    ///
    /// Callers apply layers in manifest order; a later call overwrites
    /// paths written by an earlier one. Returns the archive size.
    pub fn materialize_layer(&self, name: &str, digest: &str, mut stream: impl Read) -> Result<u64> {
        let archive = archive_path(&self.layer_dir(name), digest)?;
        let content_root = self.content_root(name);
        fs::create_dir_all(&content_root).map_err(|e| Error::store_io(&content_root, e))?;

        let partial = partial_path(&archive);
        let written = (|| -> std::io::Result<u64> {
            let mut file = File::create(&partial)?;
            let n = std::io::copy(&mut stream, &mut file)?;
            file.sync_all()?;
            Ok(n)
        })()
        .map_err(|e| {
            let _ = fs::remove_file(&partial);
            Error::store_io(&partial, e)
        })?;
        fs::rename(&partial, &archive).map_err(|e| Error::store_io(&archive, e))?;

        unpack_layer(&archive, digest, &content_root, 0)?;
        Ok(written)
    }

    /// Starts a staged pull for `name`.
    pub fn begin_pull(&self, name: &str) -> Result<StagedPull> {
        let staging = self
            .image_dir(name)
            .join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::now_v7()));
        let contents = staging.join(LAYERS_DIR).join(CONTENTS_DIR);
        fs::create_dir_all(&contents).map_err(|e| Error::store_io(&contents, e))?;
        debug!(image = %name, staging = %staging.display(), "staging pull");
        Ok(StagedPull {
            store: self.clone(),
            name: name.to_string(),
            staging,
            extracted: 0,
            committed: false,
        })
    }

    /// Lists stored images in directory order.
    ///
    /// # Errors
    ///
    /// [`Error::CorruptRecord`] if a manifest file is not valid JSON.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let entries = fs::read_dir(&self.base_dir).map_err(|e| Error::store_io(&self.base_dir, e))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::store_io(&self.base_dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXT) || !path.is_file() {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let raw = fs::read_to_string(&path).map_err(|e| Error::store_io(&path, e))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).map_err(|e| Error::CorruptRecord {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;

            let name = value
                .get("name")
                .and_then(|v| v.as_str())
                .map_or_else(|| key.replacen('_', "/", 1), str::to_string);
            let tag = value
                .get("tag")
                .and_then(|v| v.as_str())
                .unwrap_or(crate::constants::DEFAULT_TAG)
                .to_string();
            let size_bytes = tree_size(&self.layer_dir(key))?;

            records.push(ImageRecord {
                name,
                tag,
                size_bytes,
                record_path: path,
            });
        }
        Ok(records)
    }
}

// =============================================================================
// Staged Pull
// =============================================================================

/// A pull in progress, assembled away from the live record.
///
/// Dropping an uncommitted pull removes its staging directory.
#[derive(Debug)]
pub struct StagedPull {
    store: ImageStore,
    name: String,
    staging: PathBuf,
    extracted: u64,
    committed: bool,
}

impl StagedPull {
    fn layer_dir(&self) -> PathBuf {
        self.staging.join(LAYERS_DIR)
    }

    /// Staged content root.
    pub fn content_root(&self) -> PathBuf {
        self.layer_dir().join(CONTENTS_DIR)
    }

    /// Final archive path of `digest` within the staging area.
    pub fn archive_path(&self, digest: &str) -> Result<PathBuf> {
        archive_path(&self.layer_dir(), digest)
    }

    /// Scratch path a download writes to before it is renamed to
    /// [`Self::archive_path`].
    pub fn partial_archive_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(partial_path(&self.archive_path(digest)?))
    }

    /// Extracts an installed archive over the staged content root.
    pub fn extract(&mut self, digest: &str) -> Result<()> {
        let archive = self.archive_path(digest)?;
        self.extracted = unpack_layer(&archive, digest, &self.content_root(), self.extracted)?;
        Ok(())
    }

    /// Bytes extracted so far across all layers.
    pub fn extracted_bytes(&self) -> u64 {
        self.extracted
    }

    /// Swaps the staged layers into place and saves the manifest.
    pub fn commit(mut self, manifest: &ImageManifest) -> Result<PathBuf> {
        let live = self.store.layer_dir(&self.name);
        let retired = self.staging.join("retired");

        if live.exists() {
            fs::rename(&live, &retired).map_err(|e| Error::store_io(&live, e))?;
        }
        if let Err(e) = fs::rename(self.layer_dir(), &live) {
            if retired.exists() {
                let _ = fs::rename(&retired, &live);
            }
            return Err(Error::store_io(&live, e));
        }

        let record = match self.store.save(manifest) {
            Ok(record) => record,
            Err(e) => {
                self.restore(&live, &retired);
                return Err(e);
            }
        };
        self.committed = true;
        if let Err(e) = fs::remove_dir_all(&self.staging) {
            warn!(path = %self.staging.display(), error = %e, "failed to remove staging directory");
        }

        info!(
            image = %manifest.name,
            tag = %manifest.tag,
            bytes = self.extracted,
            "image committed"
        );
        Ok(record)
    }
}

impl StagedPull {
    /// Moves the new layers back into staging and the retired ones back
    /// into place, undoing the swap in [`Self::commit`].
    fn restore(&self, live: &Path, retired: &Path) {
        if let Err(e) = fs::rename(live, self.layer_dir()) {
            warn!(path = %live.display(), error = %e, "failed to withdraw new layers");
            return;
        }
        if retired.exists()
            && let Err(e) = fs::rename(retired, live)
        {
            warn!(path = %retired.display(), error = %e, "failed to restore previous layers");
        }
    }
}

impl Drop for StagedPull {
    fn drop(&mut self) {
        if !self.committed
            && let Err(e) = fs::remove_dir_all(&self.staging)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.staging.display(), error = %e, "failed to discard staged pull");
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn archive_path(layer_dir: &Path, digest: &str) -> Result<PathBuf> {
    validate_digest(digest).map_err(|reason| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: reason.to_string(),
    })?;
    Ok(layer_dir.join(format!("{}.{}", digest, LAYER_ARCHIVE_EXT)))
}

fn partial_path(archive: &Path) -> PathBuf {
    archive.with_extension("partial")
}

/// Writes `data` to a unique temp file next to `path` and renames it over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| Error::store_io(parent, e))?;

    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    let result = (|| -> std::io::Result<()> {
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    result.map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::store_io(path, e)
    })
}

/// Sums the sizes of regular files under `dir`, recursively. Symlinks are
/// not followed.
pub fn tree_size(dir: &Path) -> Result<u64> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::store_io(dir, e)),
    };

    let mut total = 0u64;
    for entry in entries {
        let entry = entry.map_err(|e| Error::store_io(dir, e))?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path).map_err(|e| Error::store_io(&path, e))?;
        if meta.is_dir() {
            total += tree_size(&path)?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Unpacks one layer archive (plain or gzip tar) over `dest`.
///
/// `extracted_so_far` is the running total for the image; the new total is
/// returned and checked against [`MAX_ROOTFS_SIZE`].
pub fn unpack_layer(archive_path: &Path, digest: &str, dest: &Path, extracted_so_far: u64) -> Result<u64> {
    let fail = |reason: String| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason,
    };

    let file = File::open(archive_path).map_err(|e| Error::store_io(archive_path, e))?;
    let mut reader = BufReader::new(file);
    let gzip = reader
        .fill_buf()
        .map_err(|e| Error::store_io(archive_path, e))?
        .starts_with(&GZIP_MAGIC);
    let input: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let real_dest = fs::canonicalize(dest).map_err(|e| Error::store_io(dest, e))?;
    let is_root = nix::unistd::geteuid().is_root();
    let mut archive = Archive::new(input);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let mut total = extracted_so_far;
    let mut entries_seen = 0usize;

    for entry in archive.entries().map_err(|e| fail(e.to_string()))? {
        let mut entry = entry.map_err(|e| fail(e.to_string()))?;
        let path = entry.path().map_err(|e| fail(e.to_string()))?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::PathTraversal {
                path: path.to_string_lossy().into_owned(),
            });
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent = path.parent().unwrap_or(Path::new(""));
        if file_name == OPAQUE_WHITEOUT {
            if let Some(dir) = resolve_within(&real_dest, dest, parent, &path)? {
                clear_dir(&dir)?;
            }
            continue;
        }
        if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            if let Some(dir) = resolve_within(&real_dest, dest, parent, &path)? {
                remove_path(&dir.join(target))?;
            }
            continue;
        }

        let kind = entry.header().entry_type();
        if matches!(kind, EntryType::Char | EntryType::Block | EntryType::Fifo) && !is_root {
            debug!(digest, path = %path.display(), "skipping device node");
            continue;
        }

        total += entry.size();
        if total > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: total,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        // A later layer may replace a directory with a file or the reverse.
        if let Some(dir) = resolve_within(&real_dest, dest, parent, &path)?
            && let Some(name) = path.file_name()
        {
            let target = dir.join(name);
            if let Ok(existing) = fs::symlink_metadata(&target)
                && !(existing.is_dir() && kind == EntryType::Directory)
            {
                remove_path(&target)?;
            }
        }

        entry.unpack_in(dest).map_err(|e| fail(format!("{}: {}", path.display(), e)))?;
        entries_seen += 1;
    }

    debug!(digest, entries = entries_seen, gzip, bytes = total - extracted_so_far, "layer extracted");
    Ok(total)
}

/// Resolves `dest/relative` through any symlinks earlier entries created
/// and checks the result stays under `real_dest`. `None` when the directory
/// does not exist yet, so there is nothing to remove.
fn resolve_within(real_dest: &Path, dest: &Path, relative: &Path, entry: &Path) -> Result<Option<PathBuf>> {
    let dir = dest.join(relative);
    match fs::canonicalize(&dir) {
        Ok(real) if real.starts_with(real_dest) => Ok(Some(real)),
        Ok(_) => Err(Error::PathTraversal {
            path: entry.to_string_lossy().into_owned(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::store_io(&dir, e)),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(|e| Error::store_io(path, e))
}

fn clear_dir(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::store_io(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| Error::store_io(dir, e))?;
        remove_path(&entry.path())?;
    }
    Ok(())
}
