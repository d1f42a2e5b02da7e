//! Kubernetes job backend, driven through the `kubectl` CLI.
//!
//! In-cluster deployments share one workspace volume (a PVC mounted at the
//! same path in every pod), so host paths are valid inside the sandbox and
//! no per-directory binds are needed.

use crate::{
    ExitStatus, SandboxError, SandboxPaths, SandboxRunner, SandboxSpec, SANDBOX_CPUS,
    TOOLCHAIN_IMAGE,
};
use fuzzmill_io::thread::read_background;
use nix::unistd::{getgid, getuid};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static INSTANCE_SEQ: AtomicU64 = AtomicU64::new(0);

/// PVC holding the shared workspace.
// TODO: make the claim name configurable once more than one deployment
// shape exists.
pub const WORKSPACE_CLAIM: &str = "fuzzmill-pvc";

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct K8sJobRunner {
    namespace: String,
    image: String,
    job_name: Option<String>,
    logs: Option<Child>,
    stopped: bool,
}

impl K8sJobRunner {
    pub fn new<S: Into<String>>(namespace: S) -> Self {
        Self {
            namespace: namespace.into(),
            image: TOOLCHAIN_IMAGE.to_string(),
            job_name: None,
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

impl SandboxRunner for K8sJobRunner {
    fn start(&mut self, spec: &SandboxSpec) -> Result<String, SandboxError> {
        let name = rfc1123_name(&format!(
            "fuzzmill-{}-{}",
            std::process::id(),
            INSTANCE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let manifest = job_manifest(&name, &self.image, spec);

        let mut child = Command::new("kubectl")
            .args(["create", "-n", &self.namespace, "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                tool: "kubectl",
                source,
            })?;
        child
            .stdin
            .take()
            .unwrap()
            .write_all(manifest.to_string().as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(SandboxError::Backend {
                tool: "kubectl",
                msg: format!(
                    "job creation failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        log::debug!("created job {}", name);
        self.job_name = Some(name.clone());
        Ok(name)
    }

    fn stream_logs(&mut self) -> Result<Box<dyn Read + Send>, SandboxError> {
        let name = self.job_name.as_ref().ok_or(SandboxError::NotStarted)?;
        let mut child = Command::new("kubectl")
            .args([
                "logs",
                "-n",
                &self.namespace,
                "-f",
                &format!("job/{}", name),
                "--pod-running-timeout=5m",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                tool: "kubectl",
                source,
            })?;
        let stdout = child.stdout.take().unwrap();
        read_background(child.stderr.take().unwrap());
        self.logs = Some(child);
        Ok(Box::new(stdout))
    }

    fn wait(&mut self) -> Result<ExitStatus, SandboxError> {
        let name = self.job_name.clone().ok_or(SandboxError::NotStarted)?;
        loop {
            let output = Command::new("kubectl")
                .args([
                    "get",
                    "job",
                    &name,
                    "-n",
                    &self.namespace,
                    "-o",
                    "jsonpath={.status.succeeded}/{.status.failed}",
                ])
                .output()
                .map_err(|source| SandboxError::Spawn {
                    tool: "kubectl",
                    source,
                })?;
            if !output.status.success() {
                return Ok(ExitStatus::Failed {
                    code: None,
                    reason: format!(
                        "job {} not found: {}",
                        name,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
            let counters = String::from_utf8_lossy(&output.stdout).into_owned();
            match parse_job_counters(&counters) {
                Some(JobState::Succeeded) => return Ok(ExitStatus::Ok),
                Some(JobState::Failed) => {
                    return Ok(ExitStatus::Failed {
                        code: None,
                        reason: format!("job {} failed", name),
                    })
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.reap_logs();
        let Some(name) = self.job_name.clone() else {
            return;
        };
        let out = Command::new("kubectl")
            .args([
                "delete",
                "job",
                &name,
                "-n",
                &self.namespace,
                "--ignore-not-found",
                "--cascade=background",
                "--wait=false",
            ])
            .output();
        match out {
            Ok(output) if !output.status.success() => {
                log::debug!(
                    "failed to delete job {}: {}",
                    name,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => log::debug!("failed to delete job {}: {}", name, e),
            _ => {}
        }
    }
}

impl Drop for K8sJobRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The shared PVC makes host paths valid in-pod, so no mapping is applied.
pub fn path_map(project_dir: &Path, corpus_dir: &Path, package: &str) -> SandboxPaths {
    SandboxPaths {
        work_dir: project_dir.join(package).display().to_string(),
        corpus_dir: corpus_dir.display().to_string(),
    }
}

enum JobState {
    Succeeded,
    Failed,
}

fn parse_job_counters(counters: &str) -> Option<JobState> {
    let (succeeded, failed) = counters.trim().split_once('/')?;
    if succeeded.parse::<u32>().unwrap_or(0) > 0 {
        return Some(JobState::Succeeded);
    }
    if failed.parse::<u32>().unwrap_or(0) > 0 {
        return Some(JobState::Failed);
    }
    None
}

/// Kubernetes object names are lowercase RFC 1123 labels.
fn rfc1123_name(raw: &str) -> String {
    let mut name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    name.truncate(63);
    name.trim_matches('-').to_string()
}

fn job_manifest(name: &str, image: &str, spec: &SandboxSpec) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "name": name },
        "spec": {
            // no retries: a crashing fuzz target must not be restarted
            "backoffLimit": 0,
            "template": {
                "spec": {
                    "restartPolicy": "Never",
                    "securityContext": {
                        "runAsUser": getuid().as_raw(),
                        "runAsGroup": getgid().as_raw(),
                    },
                    "containers": [{
                        "name": "fuzz-container",
                        "image": image,
                        "command": spec.command,
                        "workingDir": spec.work_dir,
                        "env": [{ "name": "GOCACHE", "value": "/tmp" }],
                        "volumeMounts": [{
                            "name": "fuzzmill-workspace",
                            "mountPath": workspace_root(spec),
                        }],
                        "resources": {
                            "requests": { "cpu": SANDBOX_CPUS.to_string(), "memory": "2Gi" },
                            "limits": { "cpu": SANDBOX_CPUS.to_string(), "memory": "2Gi" },
                        },
                    }],
                    "volumes": [{
                        "name": "fuzzmill-workspace",
                        "persistentVolumeClaim": { "claimName": WORKSPACE_CLAIM },
                    }],
                }
            }
        }
    })
}

/// The workspace root is the parent of the project directory; mounting it
/// makes both the project and the corpus visible to the pod.
fn workspace_root(spec: &SandboxSpec) -> String {
    spec.project_dir
        .parent()
        .unwrap_or(&spec.project_dir)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn job_names_are_rfc1123() {
        assert_eq!(rfc1123_name("fuzzmill-123-0"), "fuzzmill-123-0");
        assert_eq!(rfc1123_name("Fuzz_Mill/Job"), "fuzz-mill-job");
        assert!(rfc1123_name(&"x".repeat(100)).len() <= 63);
    }

    #[test]
    fn manifest_pins_limits_and_disables_retries() {
        let spec = SandboxSpec {
            project_dir: PathBuf::from("/var/lib/fuzzmill/project"),
            corpus_dir: PathBuf::from("/var/lib/fuzzmill/repo_corpus/pkg/testdata/fuzz"),
            work_dir: "/var/lib/fuzzmill/project/pkg".to_string(),
            command: vec!["go".into(), "test".into()],
        };
        let manifest = job_manifest("fuzzmill-1-0", TOOLCHAIN_IMAGE, &spec);

        assert_eq!(manifest["spec"]["backoffLimit"], 0);
        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["resources"]["limits"]["memory"], "2Gi");
        assert_eq!(container["resources"]["limits"]["cpu"], "1");
        assert_eq!(container["workingDir"], "/var/lib/fuzzmill/project/pkg");
        assert_eq!(
            manifest["spec"]["template"]["spec"]["volumes"][0]["persistentVolumeClaim"]
                ["claimName"],
            WORKSPACE_CLAIM
        );
        // the PVC mount covers the whole workspace
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/var/lib/fuzzmill");
    }

    #[test]
    fn job_counters_decide_terminal_state() {
        assert!(matches!(parse_job_counters("1/"), Some(JobState::Succeeded)));
        assert!(matches!(parse_job_counters("/1"), Some(JobState::Failed)));
        assert!(parse_job_counters("/").is_none());
        assert!(parse_job_counters("").is_none());
    }
}
