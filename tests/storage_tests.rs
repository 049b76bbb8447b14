//! Tests for the image store.
//!
//! Validates manifest persistence, layer materialization order, whiteouts,
//! path traversal protection, staged re-pulls and listing.

use flate2::Compression;
use flate2::write::GzEncoder;
use mocker::storage::{ImageStore, tree_size, unpack_layer};
use mocker::{Error, ImageManifest, ImageRef};
use std::fs;
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

fn layer_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Archive with an entry named `../escape`, which `tar::Builder` would refuse.
fn traversal_tar() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_old();
    let name = b"../escape";
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append(&header, &b"evil"[..]).unwrap();
    builder.into_inner().unwrap()
}

/// Archive with a symlink `link -> target` followed by regular files.
fn symlink_tar(link: &str, target: &Path, files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    builder.append_link(&mut header, link, target).unwrap();
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

/// A directory outside the store holding `victim`.
fn outside_dir(temp: &TempDir) -> std::path::PathBuf {
    let host = temp.path().join("host");
    fs::create_dir_all(&host).unwrap();
    fs::write(host.join("victim"), "host data").unwrap();
    host
}

fn manifest(reference: &str, layers_top_first: &[&str]) -> ImageManifest {
    let reference = ImageRef::parse(reference).unwrap();
    let fs_layers: Vec<_> = layers_top_first
        .iter()
        .map(|d| serde_json::json!({ "blobSum": d }))
        .collect();
    let raw = serde_json::json!({
        "name": reference.repository(),
        "tag": reference.tag,
        "fsLayers": fs_layers,
        "history": [{ "v1Compatibility": r#"{"config":{"Cmd":["/bin/true"]}}"# }],
    })
    .to_string();
    ImageManifest::from_registry_json(&raw, &reference).unwrap()
}

fn store(temp: &TempDir) -> ImageStore {
    ImageStore::with_path(temp.path().join("store")).unwrap()
}

fn staging_dirs(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().starts_with(".staging-"))
                .count()
        })
        .unwrap_or(0)
}

// =============================================================================
// Store Creation Tests
// =============================================================================

#[test]
fn test_store_creates_nested_dirs() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("deeply").join("nested").join("store");
    let store = ImageStore::with_path(path.clone()).unwrap();
    assert!(path.is_dir());
    assert_eq!(store.base_dir(), path);
}

#[test]
fn test_paths_keyed_by_repository() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    assert!(store.manifest_path("library/hello").ends_with("library_hello.json"));
    assert!(store.content_root("library/hello").ends_with("library_hello/layers/contents"));
    assert_eq!(store.manifest_path("library/hello"), store.manifest_path("library_hello"));
}

// =============================================================================
// Manifest Record Tests
// =============================================================================

#[test]
fn test_save_and_load_roundtrip_keeps_raw_body() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let m = manifest("hello:1.0", &["sha256:bb", "sha256:aa"]);

    let path = store.save(&m).unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), m.raw);
    assert!(store.has("library/hello"));

    let loaded = store.load(&ImageRef::parse("hello:1.0").unwrap()).unwrap();
    assert_eq!(loaded.tag, "1.0");
    assert_eq!(loaded.layers, vec!["sha256:aa", "sha256:bb"]);
}

#[test]
fn test_load_missing_image() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let err = store.load(&ImageRef::parse("absent").unwrap()).unwrap_err();
    assert!(matches!(err, Error::ImageNotFound(ref name) if name == "library/absent"));
}

#[test]
fn test_corrupt_record_detected() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    fs::write(store.manifest_path("library/broken"), "{ not json").unwrap();

    let err = store.load(&ImageRef::parse("broken").unwrap()).unwrap_err();
    assert!(matches!(err, Error::CorruptRecord { .. }));
    assert!(matches!(store.list(), Err(Error::CorruptRecord { .. })));
}

// =============================================================================
// Layer Materialization Tests
// =============================================================================

#[test]
fn test_later_layer_overwrites_earlier() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let base = layer_tar(&[("etc/motd", b"base"), ("bin/tool", b"v1")]);
    let top = layer_tar(&[("etc/motd", b"top")]);

    store.materialize_layer("library/app", "sha256:aa", &base[..]).unwrap();
    store.materialize_layer("library/app", "sha256:bb", &top[..]).unwrap();

    let root = store.content_root("library/app");
    assert_eq!(fs::read_to_string(root.join("etc/motd")).unwrap(), "top");
    assert_eq!(fs::read_to_string(root.join("bin/tool")).unwrap(), "v1");
    assert!(store.layer_dir("library/app").join("sha256:aa.tar").is_file());
    assert!(store.layer_dir("library/app").join("sha256:bb.tar").is_file());
}

#[test]
fn test_gzip_layer_detected_by_magic() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let layer = gzip(&layer_tar(&[("hello.txt", b"compressed")]));

    store.materialize_layer("library/gz", "sha256:cc", &layer[..]).unwrap();
    let root = store.content_root("library/gz");
    assert_eq!(fs::read_to_string(root.join("hello.txt")).unwrap(), "compressed");
}

#[test]
fn test_whiteout_removes_lower_file() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let base = layer_tar(&[("etc/keep", b"k"), ("etc/drop", b"d")]);
    let top = layer_tar(&[("etc/.wh.drop", b"")]);

    store.materialize_layer("library/wh", "sha256:aa", &base[..]).unwrap();
    store.materialize_layer("library/wh", "sha256:bb", &top[..]).unwrap();

    let root = store.content_root("library/wh");
    assert!(root.join("etc/keep").exists());
    assert!(!root.join("etc/drop").exists());
    assert!(!root.join("etc/.wh.drop").exists());
}

#[test]
fn test_opaque_whiteout_clears_directory() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("root");
    fs::create_dir_all(&dest).unwrap();
    let base = temp.path().join("base.tar");
    let top = temp.path().join("top.tar");
    fs::write(&base, layer_tar(&[("var/a", b"a"), ("var/b", b"b")])).unwrap();
    fs::write(&top, layer_tar(&[("var/.wh..wh..opq", b""), ("var/c", b"c")])).unwrap();

    let after_base = unpack_layer(&base, "sha256:aa", &dest, 0).unwrap();
    unpack_layer(&top, "sha256:bb", &dest, after_base).unwrap();

    let mut names: Vec<String> = fs::read_dir(dest.join("var"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["c"]);
}

#[test]
fn test_path_traversal_rejected() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let err = store
        .materialize_layer("library/evil", "sha256:ee", &traversal_tar()[..])
        .unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }));
    assert!(!temp.path().join("store/library_evil/layers/escape").exists());
}

#[test]
fn test_file_under_escaping_symlink_leaves_host_untouched() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let host = outside_dir(&temp);
    let layer = symlink_tar("etc", &host, &[("etc/victim", b"overwritten")]);

    let err = store
        .materialize_layer("library/evil", "sha256:aa", &layer[..])
        .unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }), "{err:?}");
    assert_eq!(fs::read_to_string(host.join("victim")).unwrap(), "host data");
}

#[test]
fn test_whiteout_under_escaping_symlink_leaves_host_untouched() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let host = outside_dir(&temp);
    let base = symlink_tar("etc", &host, &[]);
    let top = layer_tar(&[("etc/.wh.victim", b"")]);

    store.materialize_layer("library/evil", "sha256:aa", &base[..]).unwrap();
    let err = store
        .materialize_layer("library/evil", "sha256:bb", &top[..])
        .unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }), "{err:?}");
    assert!(host.join("victim").exists());
}

#[test]
fn test_opaque_whiteout_under_escaping_symlink_leaves_host_untouched() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let host = outside_dir(&temp);
    let base = symlink_tar("etc", &host, &[]);
    let top = layer_tar(&[("etc/.wh..wh..opq", b"")]);

    store.materialize_layer("library/evil", "sha256:aa", &base[..]).unwrap();
    assert!(store.materialize_layer("library/evil", "sha256:bb", &top[..]).is_err());
    assert!(host.join("victim").exists());
}

#[test]
fn test_whiteout_through_internal_symlink_allowed() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let base = symlink_tar("lib", Path::new("usr/lib"), &[("usr/lib/libold.so", b"x")]);
    let top = layer_tar(&[("lib/.wh.libold.so", b"")]);

    store.materialize_layer("library/merged", "sha256:aa", &base[..]).unwrap();
    store.materialize_layer("library/merged", "sha256:bb", &top[..]).unwrap();
    assert!(!store.content_root("library/merged").join("usr/lib/libold.so").exists());
}

#[test]
fn test_invalid_digest_never_becomes_a_path() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let layer = layer_tar(&[("a", b"a")]);
    let err = store
        .materialize_layer("library/app", "sha256:../../x", &layer[..])
        .unwrap_err();
    assert!(matches!(err, Error::LayerExtractionFailed { .. }));
}

#[test]
fn test_executable_bit_preserved() {
    use std::os::unix::fs::PermissionsExt;

    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let layer = layer_tar(&[("bin/run", b"#!/bin/sh\n")]);
    store.materialize_layer("library/perm", "sha256:aa", &layer[..]).unwrap();

    let mode = fs::metadata(store.content_root("library/perm").join("bin/run"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o111, 0o111);
}

// =============================================================================
// Staged Pull Tests
// =============================================================================

#[test]
fn test_staged_pull_commit_replaces_live_record() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    store
        .materialize_layer("library/app", "sha256:aa", &layer_tar(&[("old", b"1")])[..])
        .unwrap();

    let m = manifest("app:2.0", &["sha256:bb"]);
    let mut staged = store.begin_pull("library/app").unwrap();
    fs::write(staged.archive_path("sha256:bb").unwrap(), layer_tar(&[("new", b"2")])).unwrap();
    staged.extract("sha256:bb").unwrap();
    assert_eq!(staged.extracted_bytes(), 1);
    staged.commit(&m).unwrap();

    let root = store.content_root("library/app");
    assert!(root.join("new").exists());
    assert!(!root.join("old").exists(), "stale content from the previous pull");
    assert_eq!(store.load(&ImageRef::parse("app:2.0").unwrap()).unwrap().tag, "2.0");
    assert_eq!(staging_dirs(&temp.path().join("store/library_app")), 0);
}

#[test]
fn test_failed_repull_leaves_live_record_untouched() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let first = manifest("app:1.0", &["sha256:aa"]);
    let mut staged = store.begin_pull("library/app").unwrap();
    fs::write(staged.archive_path("sha256:aa").unwrap(), layer_tar(&[("v", b"1")])).unwrap();
    staged.extract("sha256:aa").unwrap();
    staged.commit(&first).unwrap();

    {
        let mut staged = store.begin_pull("library/app").unwrap();
        fs::write(staged.archive_path("sha256:ee").unwrap(), traversal_tar()).unwrap();
        assert!(staged.extract("sha256:ee").is_err());
        // dropped without commit
    }

    let root = store.content_root("library/app");
    assert_eq!(fs::read_to_string(root.join("v")).unwrap(), "1");
    assert_eq!(store.load(&ImageRef::parse("app:1.0").unwrap()).unwrap().tag, "1.0");
    assert_eq!(staging_dirs(&temp.path().join("store/library_app")), 0);
}

#[test]
fn test_commit_restores_previous_layers_when_manifest_save_fails() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);
    let mut staged = store.begin_pull("library/app").unwrap();
    fs::write(staged.archive_path("sha256:aa").unwrap(), layer_tar(&[("v", b"1")])).unwrap();
    staged.extract("sha256:aa").unwrap();
    staged.commit(&manifest("app:1.0", &["sha256:aa"])).unwrap();

    // A non-empty directory where the manifest goes makes the rename fail.
    let record = store.manifest_path("library/app");
    fs::remove_file(&record).unwrap();
    fs::create_dir_all(record.join("blocker")).unwrap();

    let mut staged = store.begin_pull("library/app").unwrap();
    fs::write(staged.archive_path("sha256:bb").unwrap(), layer_tar(&[("v", b"2")])).unwrap();
    staged.extract("sha256:bb").unwrap();
    assert!(staged.commit(&manifest("app:2.0", &["sha256:bb"])).is_err());

    let root = store.content_root("library/app");
    assert_eq!(fs::read_to_string(root.join("v")).unwrap(), "1");
    assert!(store.layer_dir("library/app").join("sha256:aa.tar").is_file());
    assert!(!store.layer_dir("library/app").join("sha256:bb.tar").exists());
    assert_eq!(staging_dirs(&temp.path().join("store/library_app")), 0);
}

// =============================================================================
// Listing Tests
// =============================================================================

#[test]
fn test_list_reports_name_tag_and_recursive_size() {
    let temp = TempDir::new().unwrap();
    let store = store(&temp);

    let m = manifest("hello", &["sha256:aa"]);
    let layer = layer_tar(&[("a/b/c/deep.bin", &[0u8; 100]), ("top.bin", &[0u8; 20])]);
    store.materialize_layer("library/hello", "sha256:aa", &layer[..]).unwrap();
    store.save(&m).unwrap();

    let records = store.list().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.name, "library/hello");
    assert_eq!(record.tag, "latest");
    assert_eq!(record.record_path, store.manifest_path("library/hello"));
    // archive plus the 120 extracted bytes
    assert_eq!(record.size_bytes, layer.len() as u64 + 120);
    assert_eq!(record.size_bytes, tree_size(&store.layer_dir("library/hello")).unwrap());
}

#[test]
fn test_list_empty_store() {
    let temp = TempDir::new().unwrap();
    assert!(store(&temp).list().unwrap().is_empty());
}
