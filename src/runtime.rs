//! # Process Execution
//!
//! An [`ExecutionContext`] describes the isolation a container process
//! needs. [`ExecutionContext::spawn`] forks, applies it in the child and
//! only then execs the target program:
//!
//! ```text
//! parent                              child (after fork, before exec)
//! ──────                              ───────────────────────────────
//! open netns handle, cgroup.procs
//! create stage pipe (CLOEXEC)
//! fork ─────────────────────────────► environment already applied
//!                                     setns(netns, CLONE_NEWNET)     stage 1
//!                                     write "0" to cgroup.procs      stage 2
//!                                     chroot(content root)           stage 3
//!                                     chdir(working dir or /)        stage 4
//!                                     execvp(argv[0])
//! ```
//!
//! Everything that can allocate or touch the filesystem by path outside
//! the new root is prepared in the parent. A failing stage writes its
//! number and errno to the stage pipe and aborts the spawn, so the target
//! never runs unconfined. The pipe is close-on-exec: a successful exec
//! leaves it empty.
//!
//! `Command::current_dir` is not used: it changes directory before the
//! pre-exec hook runs, i.e. outside the new root.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Child-side setup stage, as reported through the stage pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SetupStage {
    EnterNamespace = 1,
    JoinCgroup = 2,
    ChangeRoot = 3,
    ChangeDirectory = 4,
}

impl SetupStage {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::EnterNamespace),
            2 => Some(Self::JoinCgroup),
            3 => Some(Self::ChangeRoot),
            4 => Some(Self::ChangeDirectory),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::EnterNamespace => "entering network namespace",
            Self::JoinCgroup => "joining cgroup",
            Self::ChangeRoot => "changing root",
            Self::ChangeDirectory => "changing working directory",
        }
    }
}

/// Isolation and command line for one container process.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Identifier used in errors and logs.
    pub id: String,
    /// Program and arguments; `argv[0]` is resolved inside the new root.
    pub argv: Vec<String>,
    /// Complete environment of the process.
    pub env: Vec<(String, String)>,
    /// New filesystem root.
    pub root: PathBuf,
    /// Working directory inside `root`; `/` when unset.
    pub working_dir: Option<String>,
    /// Network namespace handle to enter.
    pub netns: Option<PathBuf>,
    /// `cgroup.procs` files the process adds itself to.
    pub cgroup_procs: Vec<PathBuf>,
    /// Pipe stdout/stderr back instead of inheriting them.
    pub capture_output: bool,
}

impl ExecutionContext {
    pub fn new(id: impl Into<String>, argv: Vec<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            argv,
            root: root.into(),
            ..Default::default()
        }
    }

    /// Spawns the process with the context applied.
    ///
    /// # Errors
    ///
    /// - [`Error::ContainerSetup`] or [`Error::Permission`] when a setup
    ///   stage fails; the target program has not run
    /// - [`Error::ProcessLaunch`] when the program cannot be executed
    pub fn spawn(&self) -> Result<ContainerProcess> {
        let Some(program) = self.argv.first() else {
            return Err(Error::ProcessLaunch {
                command: String::new(),
                not_found: true,
                reason: "image defines no command and none was given".to_string(),
            });
        };

        let setup_err = |what: &str, e: std::io::Error| self.setup_error(what, e);

        let netns = self
            .netns
            .as_ref()
            .map(|path| File::open(path).map_err(|e| setup_err(&format!("open {}", path.display()), e)))
            .transpose()?;
        let procs = self
            .cgroup_procs
            .iter()
            .map(|path| {
                OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|e| setup_err(&format!("open {}", path.display()), e))
            })
            .collect::<Result<Vec<File>>>()?;
        let root = path_cstring(&self.root).map_err(|e| setup_err("root path", e))?;
        let workdir = CString::new(self.working_dir.as_deref().unwrap_or("/"))
            .map_err(|e| setup_err("working directory", e.into()))?;

        let (mut stage_reader, stage_writer) =
            std::io::pipe().map_err(|e| setup_err("stage pipe", e))?;
        let stage_fd = stage_writer.as_raw_fd();

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&self.argv[1..])
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true);
        if self.capture_output {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        } else {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }

        // SAFETY: the hook runs between fork and exec. It only issues
        // syscalls on descriptors and C strings prepared in the parent.
        unsafe {
            cmd.pre_exec(move || apply_in_child(stage_fd, netns.as_ref(), &procs, &root, &workdir));
        }

        let spawned = cmd.spawn();
        drop(stage_writer);

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let mut report = Vec::new();
                let _ = stage_reader.read_to_end(&mut report);
                return Err(self.classify_spawn_failure(program, &report, e));
            }
        };

        let pid = child.id().unwrap_or_default();
        info!(container = %self.id, pid, command = %self.argv.join(" "), "process started");

        let stdout = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                buf
            })
        });

        Ok(ContainerProcess {
            id: self.id.clone(),
            pid,
            child,
            stdout,
            stderr,
        })
    }

    fn setup_error(&self, what: &str, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Error::Permission {
                operation: what.to_string(),
                reason: e.to_string(),
            }
        } else {
            Error::ContainerSetup {
                id: self.id.clone(),
                reason: format!("{}: {}", what, e),
            }
        }
    }

    fn classify_spawn_failure(&self, program: &str, report: &[u8], e: std::io::Error) -> Error {
        if let [stage, errno @ ..] = report
            && let Some(stage) = SetupStage::from_byte(*stage)
        {
            let errno = <[u8; 4]>::try_from(errno).map_or(0, i32::from_ne_bytes);
            let cause = if errno != 0 {
                std::io::Error::from_raw_os_error(errno)
            } else {
                e
            };
            warn!(container = %self.id, stage = stage.describe(), error = %cause, "container setup failed");
            return self.setup_error(stage.describe(), cause);
        }

        let not_found = e.kind() == std::io::ErrorKind::NotFound;
        Error::ProcessLaunch {
            command: program.to_string(),
            not_found,
            reason: e.to_string(),
        }
    }
}

fn path_cstring(path: &Path) -> std::io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(std::io::Error::from)
}

/// Applies the isolation in the forked child. Must not allocate.
fn apply_in_child(
    stage_fd: RawFd,
    netns: Option<&File>,
    procs: &[File],
    root: &CString,
    workdir: &CString,
) -> std::io::Result<()> {
    let fail = |stage: SetupStage, err: std::io::Error| {
        report_stage(stage_fd, stage, err.raw_os_error().unwrap_or(0));
        err
    };

    if let Some(ns) = netns {
        nix::sched::setns(ns, nix::sched::CloneFlags::CLONE_NEWNET)
            .map_err(|e| fail(SetupStage::EnterNamespace, e.into()))?;
    }
    for file in procs {
        // "0" means the writing process itself.
        // SAFETY: valid open descriptor and a one-byte static buffer.
        let n = unsafe { libc::write(file.as_raw_fd(), b"0".as_ptr().cast(), 1) };
        if n != 1 {
            return Err(fail(SetupStage::JoinCgroup, std::io::Error::last_os_error()));
        }
    }
    nix::unistd::chroot(root.as_c_str()).map_err(|e| fail(SetupStage::ChangeRoot, e.into()))?;
    nix::unistd::chdir(workdir.as_c_str()).map_err(|e| fail(SetupStage::ChangeDirectory, e.into()))?;
    Ok(())
}

fn report_stage(fd: RawFd, stage: SetupStage, errno: i32) {
    let mut buf = [0u8; 5];
    buf[0] = stage as u8;
    buf[1..].copy_from_slice(&errno.to_ne_bytes());
    // SAFETY: fd is the write end of the stage pipe, open until exec.
    unsafe {
        libc::write(fd, buf.as_ptr().cast(), buf.len());
    }
}

/// Exit code of a finished process: its status, or 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

/// A running container process.
#[derive(Debug)]
pub struct ContainerProcess {
    id: String,
    pid: u32,
    child: tokio::process::Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl ContainerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Waits for the process to exit and returns its exit code.
    ///
    /// Cancel-safe: dropping the future leaves the process running.
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await.map_err(|e| Error::ContainerSetup {
            id: self.id.clone(),
            reason: format!("wait failed: {}", e),
        })?;
        let code = exit_code(status);
        debug!(container = %self.id, pid = self.pid, code, "process exited");
        Ok(code)
    }

    /// Sends SIGKILL. A process that already exited is not an error.
    pub fn kill(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::ContainerSetup {
                id: self.id.clone(),
                reason: format!("kill failed: {}", e),
            }),
        }
    }

    /// Captured stdout and stderr; empty when output was inherited.
    pub async fn collect_output(&mut self) -> (Vec<u8>, Vec<u8>) {
        async fn join(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
            match task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            }
        }
        let stdout = join(self.stdout.take()).await;
        let stderr = join(self.stderr.take()).await;
        (stdout, stderr)
    }
}
