//! Sandboxed execution of fuzz commands.
//!
//! A sandbox runs exactly one command under fixed resource limits (one
//! logical core, 2 GiB of memory) so that a crashing or OOMing fuzz target
//! can never take down its peers. Two backends exist: local Docker
//! containers and Kubernetes jobs, both driven through their platform CLIs.
//! Nothing backend-specific leaks out of this crate; callers only ever see
//! an opaque instance id. Backends talk to their platform through its CLI,
//! so any number of runners can operate concurrently without sharing a
//! client handle.

use std::io::Read;
use std::path::PathBuf;
use thiserror::Error;

pub mod docker;
pub mod k8s;
pub mod process;

/// Toolchain image every sandbox is pinned to.
pub const TOOLCHAIN_IMAGE: &str = "golang:1.23.9";

/// Mount point of the project tree inside the sandbox.
pub const PROJECT_MOUNT: &str = "/fuzzmill-project";

/// Mount point of the target's corpus subtree inside the sandbox.
pub const CORPUS_MOUNT: &str = "/fuzzmill-corpus";

/// Seconds a backend is given to terminate gracefully before being killed.
pub const STOP_TIMEOUT_SECS: u64 = 10;

pub const SANDBOX_CPUS: u32 = 1;
pub const SANDBOX_MEMORY_MB: u64 = 2048;

/// Backend view of the host directories for one task: where the package
/// lives and where the engine's corpus cache is, as seen from inside the
/// sandbox. Produced by each backend's `path_map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPaths {
    pub work_dir: String,
    pub corpus_dir: String,
}

/// What to run and which host directories to make visible.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Host directory bound read-write at [`PROJECT_MOUNT`].
    pub project_dir: PathBuf,
    /// Host directory bound read-write at [`CORPUS_MOUNT`].
    pub corpus_dir: PathBuf,
    /// Working directory inside the sandbox.
    pub work_dir: String,
    /// Command and arguments.
    pub command: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: std::io::Error,
    },
    #[error("{tool}: {msg}")]
    Backend { tool: &'static str, msg: String },
    #[error("sandbox not started")]
    NotStarted,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal state of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// The command exited with code zero.
    Ok,
    /// Anything else, including forceful termination.
    Failed { code: Option<i32>, reason: String },
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Ok)
    }
}

/// Capability set every backend provides. One runner drives one sandbox
/// instance; the worker that created it is its only user.
pub trait SandboxRunner: Send {
    /// Launch the sandbox. Returns an opaque instance id.
    fn start(&mut self, spec: &SandboxSpec) -> Result<String, SandboxError>;

    /// Combined stdout+stderr of the sandboxed command. The stream stays
    /// open until the backend exits and may be dropped while the backend is
    /// still running.
    fn stream_logs(&mut self) -> Result<Box<dyn Read + Send>, SandboxError>;

    /// Block until the backend terminates.
    fn wait(&mut self) -> Result<ExitStatus, SandboxError>;

    /// Best-effort graceful termination, force-killing after
    /// [`STOP_TIMEOUT_SECS`]. Idempotent; never blocks indefinitely.
    fn stop(&mut self);
}
