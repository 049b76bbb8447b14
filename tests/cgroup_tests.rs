//! Tests for resource limits.
//!
//! Runs the limiter against plain temp directories laid out like cgroup v1
//! and v2 hierarchies and checks the control files it writes.

use mocker::{CgroupVersion, ContainerIdentity, Error, ResourceLimiter, ResourceLimits};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

fn limits(cpu_percent: u32, memory_mb: u64) -> ResourceLimits {
    ResourceLimits {
        cpu_percent,
        memory_mb,
    }
}

// =============================================================================
// cgroup v2 Tests
// =============================================================================

#[test]
fn test_v2_writes_cpu_max_and_memory_max() {
    let temp = TempDir::new().unwrap();
    let limiter = ResourceLimiter::with_version(temp.path().to_path_buf(), "alice".into(), CgroupVersion::V2);
    let id = ContainerIdentity::generate();

    let handle = limiter.apply(&id, &limits(50, 500)).unwrap();
    let dir = temp.path().join("alice").join(id.short_name());
    assert_eq!(handle.dirs(), &[dir.clone()]);
    assert_eq!(handle.name(), id.short_name());
    assert_eq!(read(&dir.join("cpu.max")), "50000 100000");
    assert_eq!(read(&dir.join("memory.max")), (500u64 * 1024 * 1024).to_string());
}

#[test]
fn test_v2_enables_controllers_best_effort() {
    let temp = TempDir::new().unwrap();
    let limiter = ResourceLimiter::with_version(temp.path().to_path_buf(), "alice".into(), CgroupVersion::V2);
    limiter.apply(&ContainerIdentity::generate(), &limits(10, 64)).unwrap();

    // A plain directory keeps the last write.
    assert_eq!(read(&temp.path().join("alice/cgroup.subtree_control")), "+memory");
}

#[test]
fn test_v2_procs_file_and_add_process() {
    let temp = TempDir::new().unwrap();
    let limiter = ResourceLimiter::with_version(temp.path().to_path_buf(), "u".into(), CgroupVersion::V2);
    let handle = limiter.apply(&ContainerIdentity::generate(), &limits(25, 128)).unwrap();

    let procs = handle.procs_files();
    assert_eq!(procs.len(), 1);
    assert!(procs[0].ends_with("cgroup.procs"));

    limiter.add_process(&handle, 4242).unwrap();
    assert_eq!(read(&procs[0]), "4242");
}

// =============================================================================
// cgroup v1 Tests
// =============================================================================

#[test]
fn test_v1_writes_per_controller_files() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("cpu")).unwrap();
    fs::create_dir(temp.path().join("memory")).unwrap();
    let limiter = ResourceLimiter::with_version(temp.path().to_path_buf(), "bob".into(), CgroupVersion::V1);
    let id = ContainerIdentity::generate();

    let handle = limiter.apply(&id, &limits(20, 256)).unwrap();
    let cpu = temp.path().join("cpu/bob").join(id.short_name());
    let memory = temp.path().join("memory/bob").join(id.short_name());
    assert_eq!(handle.dirs(), &[cpu.clone(), memory.clone()]);

    assert_eq!(read(&cpu.join("cpu.shares")), "204");
    assert_eq!(read(&cpu.join("cpu.cfs_period_us")), "100000");
    assert_eq!(read(&cpu.join("cpu.cfs_quota_us")), "20000");
    assert_eq!(read(&memory.join("memory.limit_in_bytes")), (256u64 << 20).to_string());
    assert_eq!(handle.procs_files().len(), 2);
}

// =============================================================================
// Limit Validation Tests
// =============================================================================

#[test]
fn test_out_of_range_limits_rejected() {
    let temp = TempDir::new().unwrap();
    let limiter = ResourceLimiter::with_version(temp.path().to_path_buf(), "u".into(), CgroupVersion::V2);

    for bad in [limits(0, 100), limits(101, 100), limits(50, 0)] {
        let err = limiter.apply(&ContainerIdentity::generate(), &bad).unwrap_err();
        assert!(matches!(err, Error::Config(_) | Error::ResourceLimit(_)), "{err:?}");
    }
    assert!(!temp.path().join("u").exists());
}

#[test]
fn test_missing_hierarchy_detected() {
    let temp = TempDir::new().unwrap();
    let config = mocker::CgroupConfig {
        root: temp.path().join("nowhere"),
        user: Some("u".to_string()),
    };
    assert!(matches!(ResourceLimiter::new(&config), Err(Error::ResourceLimit(_))));
}

#[test]
fn test_new_detects_v2_layout() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("cgroup.controllers"), "cpu memory").unwrap();
    let config = mocker::CgroupConfig {
        root: temp.path().to_path_buf(),
        user: Some("carol".to_string()),
    };
    let limiter = ResourceLimiter::new(&config).unwrap();
    assert_eq!(limiter.version(), CgroupVersion::V2);
}

// =============================================================================
// Release Tests
// =============================================================================

#[test]
fn test_release_removes_group_directories() {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("cpu")).unwrap();
    fs::create_dir(temp.path().join("memory")).unwrap();
    let limiter = ResourceLimiter::with_version(temp.path().to_path_buf(), "bob".into(), CgroupVersion::V1);
    let handle = limiter.apply(&ContainerIdentity::generate(), &limits(50, 64)).unwrap();

    limiter.release(&handle).unwrap();
    for dir in handle.dirs() {
        assert!(!dir.exists(), "{} should be removed", dir.display());
    }
    // the per-user parent stays for other containers
    assert!(temp.path().join("cpu/bob").exists());
}

#[test]
fn test_release_twice_is_harmless() {
    let temp = TempDir::new().unwrap();
    let limiter = ResourceLimiter::with_version(temp.path().to_path_buf(), "u".into(), CgroupVersion::V2);
    let handle = limiter.apply(&ContainerIdentity::generate(), &limits(50, 64)).unwrap();

    limiter.release(&handle).unwrap();
    limiter.release(&handle).unwrap();
}
