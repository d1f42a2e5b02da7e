//! Plain-process backend: runs the command directly on the host, without
//! any resource limits. Meant for local debugging and for exercising the
//! runner contract in tests; production cycles use the Docker or
//! Kubernetes backends.

use crate::{ExitStatus, SandboxError, SandboxPaths, SandboxRunner, SandboxSpec};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

pub struct ProcessRunner {
    child: Option<Child>,
    stopped: bool,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            child: None,
            stopped: false,
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxRunner for ProcessRunner {
    fn start(&mut self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or(SandboxError::Backend {
                tool: "process",
                msg: "empty command".to_string(),
            })?;
        log::warn!("process backend provides no isolation or resource limits");
        let child = Command::new(program)
            .args(args)
            .current_dir(&spec.work_dir)
            .env("GOCACHE", "/tmp")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                tool: "process",
                source,
            })?;
        let id = child.id().to_string();
        self.child = Some(child);
        Ok(id)
    }

    fn stream_logs(&mut self) -> Result<Box<dyn Read + Send>, SandboxError> {
        let child = self.child.as_mut().ok_or(SandboxError::NotStarted)?;
        let stdout = child.stdout.take().ok_or(SandboxError::Backend {
            tool: "process",
            msg: "logs already taken".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or(SandboxError::Backend {
            tool: "process",
            msg: "logs already taken".to_string(),
        })?;
        // stderr is appended after stdout rather than interleaved; the
        // container backends provide the properly combined stream
        Ok(Box::new(stdout.chain(stderr)))
    }

    fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        let child = self.child.as_mut().ok_or(SandboxError::NotStarted)?;
        let status = child.wait()?;
        if status.success() {
            Ok(ExitStatus::Ok)
        } else {
            Ok(ExitStatus::Failed {
                code: status.code(),
                reason: format!("process exited with {}", status),
            })
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let Some(child) = self.child.as_mut() else {
            return;
        };
        // no graceful phase to speak of for a bare process
        let _ = child.kill();
        let deadline = Instant::now() + Duration::from_secs(crate::STOP_TIMEOUT_SECS);
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) | Err(_) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Host paths pass through unchanged.
pub fn path_map(project_dir: &Path, corpus_dir: &Path, package: &str) -> SandboxPaths {
    SandboxPaths {
        work_dir: project_dir.join(package).display().to_string(),
        corpus_dir: corpus_dir.display().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::path::PathBuf;

    fn spec_for(command: &[&str], work_dir: &Path) -> SandboxSpec {
        SandboxSpec {
            project_dir: work_dir.to_path_buf(),
            corpus_dir: work_dir.to_path_buf(),
            work_dir: work_dir.display().to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn runs_command_and_streams_combined_logs() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = ProcessRunner::new();
        let spec = spec_for(
            &["sh", "-c", "echo out-line; echo err-line >&2"],
            dir.path(),
        );
        runner.start(&spec).unwrap();

        let mut logs = String::new();
        runner
            .stream_logs()
            .unwrap()
            .read_to_string(&mut logs)
            .unwrap();
        assert!(logs.contains("out-line"));
        assert!(logs.contains("err-line"));
        assert!(runner.wait().unwrap().success());
    }

    #[test]
    fn nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = ProcessRunner::new();
        runner.start(&spec_for(&["sh", "-c", "exit 3"], dir.path())).unwrap();
        match runner.wait().unwrap() {
            ExitStatus::Failed { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("unexpected status: {:?}", other),
        }
    }

    #[test]
    fn stop_kills_a_running_command_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = ProcessRunner::new();
        runner
            .start(&spec_for(&["sh", "-c", "sleep 30"], dir.path()))
            .unwrap();
        runner.stop();
        runner.stop();
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut runner = ProcessRunner::new();
        let spec = SandboxSpec {
            project_dir: PathBuf::from("."),
            corpus_dir: PathBuf::from("."),
            work_dir: ".".to_string(),
            command: Vec::new(),
        };
        assert!(runner.start(&spec).is_err());
    }

    #[test]
    fn host_paths_pass_through() {
        let paths = path_map(Path::new("/ws/project"), Path::new("/ws/corpus"), "pkg");
        assert_eq!(paths.work_dir, "/ws/project/pkg");
        assert_eq!(paths.corpus_dir, "/ws/corpus");
    }
}
