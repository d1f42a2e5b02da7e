//! Docker container backend, driven through the `docker` CLI.

use crate::{
    ExitStatus, SandboxError, SandboxPaths, SandboxRunner, SandboxSpec, CORPUS_MOUNT,
    PROJECT_MOUNT, SANDBOX_CPUS, SANDBOX_MEMORY_MB, STOP_TIMEOUT_SECS, TOOLCHAIN_IMAGE,
};
use fuzzmill_io::thread::read_background;
use nix::unistd::{getgid, getuid};
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};

static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct DockerRunner {
    image: String,
    name: Option<String>,
    logs: Option<Child>,
    stopped: bool,
}

impl DockerRunner {
    pub fn new() -> Self {
        Self::with_image(TOOLCHAIN_IMAGE)
    }

    pub fn with_image<S: Into<String>>(image: S) -> Self {
        Self {
            image: image.into(),
            name: None,
            logs: None,
            stopped: false,
        }
    }

    fn reap_logs(&mut self) {
        if let Some(mut logs) = self.logs.take() {
            let _ = logs.kill();
            let _ = logs.wait();
        }
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxRunner for DockerRunner {
    fn start(&mut self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let name = format!(
            "fuzzmill-{}-{}",
            std::process::id(),
            INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let args = create_args(&name, &self.image, spec);
        docker_output(&args)?;
        docker_output(&["start".to_string(), name.clone()])?;
        log::debug!("started container {}", name);
        self.name = Some(name.clone());
        Ok(name)
    }

    fn stream_logs(&mut self) -> Result<Box<dyn Read + Send>, SandboxError> {
        let name = self.name.as_ref().ok_or(SandboxError::NotStarted)?;
        let mut child = Command::new("docker")
            .args(["logs", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                tool: "docker",
                source,
            })?;
        let stdout = child.stdout.take().unwrap();
        // The container runs with a tty, so its stdout and stderr arrive
        // combined on our stdout; this stderr only carries CLI noise.
        read_background(child.stderr.take().unwrap());
        self.logs = Some(child);
        Ok(Box::new(stdout))
    }

    fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        let name = self.name.clone().ok_or(SandboxError::NotStarted)?;
        let out = docker_output(&["wait".to_string(), name])?;
        let code: i32 = out
            .trim()
            .parse()
            .map_err(|_| SandboxError::Backend {
                tool: "docker",
                msg: format!("unexpected wait output: {:?}", out.trim()),
            })?;
        if code == 0 {
            Ok(ExitStatus::Ok)
        } else {
            Ok(ExitStatus::Failed {
                code: Some(code),
                reason: format!("container exited with status {}", code),
            })
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.reap_logs();
        let Some(name) = self.name.clone() else {
            return;
        };
        // Graceful first; the daemon force-kills once the timeout passes.
        if let Err(e) = docker_output(&[
            "stop".to_string(),
            "-t".to_string(),
            STOP_TIMEOUT_SECS.to_string(),
            name.clone(),
        ]) {
            log::debug!("failed to stop container {}: {}", name, e);
        }
        if let Err(e) = docker_output(&["rm".to_string(), "-f".to_string(), name.clone()]) {
            log::debug!("failed to remove container {}: {}", name, e);
        }
    }
}

impl Drop for DockerRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map host directories to their fixed bind mounts inside the container.
pub fn path_map(package: &str) -> SandboxPaths {
    SandboxPaths {
        work_dir: format!("{}/{}", PROJECT_MOUNT, package),
        corpus_dir: CORPUS_MOUNT.to_string(),
    }
}

fn create_args(name: &str, image: &str, spec: &SandboxSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "create".into(),
        "--name".into(),
        name.into(),
        "-t".into(),
        "--cpus".into(),
        SANDBOX_CPUS.to_string(),
        "--memory".into(),
        format!("{}m", SANDBOX_MEMORY_MB),
        "--user".into(),
        format!("{}:{}", getuid(), getgid()),
        "--env".into(),
        "GOCACHE=/tmp".into(),
        "-v".into(),
        format!("{}:{}", spec.project_dir.display(), PROJECT_MOUNT),
        "-v".into(),
        format!("{}:{}", spec.corpus_dir.display(), CORPUS_MOUNT),
        "-w".into(),
        spec.work_dir.clone(),
        image.into(),
    ];
    args.extend(spec.command.iter().cloned());
    args
}

fn docker_output(args: &[String]) -> Result<String, SandboxError> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .map_err(|source| SandboxError::Spawn {
            tool: "docker",
            source,
        })?;
    if !output.status.success() {
        return Err(SandboxError::Backend {
            tool: "docker",
            msg: format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or(""),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn create_args_enforce_resource_limits() {
        let spec = SandboxSpec {
            project_dir: PathBuf::from("/tmp/ws/project"),
            corpus_dir: PathBuf::from("/tmp/ws/repo_corpus/pkg/testdata/fuzz"),
            work_dir: format!("{}/pkg", PROJECT_MOUNT),
            command: vec!["go".into(), "test".into(), "-fuzz=^FuzzFoo$".into()],
        };
        let args = create_args("fuzzmill-1-0", "golang:1.23.9", &spec);

        let joined = args.join(" ");
        assert!(joined.contains("--cpus 1"));
        assert!(joined.contains("--memory 2048m"));
        assert!(joined.contains(&format!("/tmp/ws/project:{}", PROJECT_MOUNT)));
        assert!(joined.contains(&format!(
            "/tmp/ws/repo_corpus/pkg/testdata/fuzz:{}",
            CORPUS_MOUNT
        )));
        // the command comes last, after the image
        assert_eq!(args.last().unwrap(), "-fuzz=^FuzzFoo$");
        let image_pos = args.iter().position(|a| a == "golang:1.23.9").unwrap();
        assert_eq!(args[image_pos + 1], "go");
    }

    #[test]
    fn path_map_uses_fixed_mounts() {
        let paths = path_map("pkg/sub");
        assert_eq!(paths.work_dir, format!("{}/pkg/sub", PROJECT_MOUNT));
        assert_eq!(paths.corpus_dir, CORPUS_MOUNT);
    }
}
