//! Per-cycle scheduling: target discovery, budget computation and the
//! worker pool.

use crate::config::Config;
use crate::stats::Stats;
use crate::worker::Worker;
use crate::worker_log;
use anyhow::Context;
use fuzzmill_core::queue::{Task, TaskQueue};
use fuzzmill_core::report::{self, TargetState};
use fuzzmill_core::util::{per_target_timeout, CancelToken};
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::thread;

/// Discover all fuzz targets, split the cycle budget among them and drive
/// `num_workers` workers over one shared queue.
///
/// Worker failures have errgroup semantics: the first error cancels the
/// cycle token so the peers stop, every thread is joined, and that first
/// error is returned.
pub fn schedule_fuzzing(
    config: &Arc<Config>,
    token: &CancelToken,
    minimize: bool,
    stats: &Arc<Stats>,
) -> anyhow::Result<()> {
    log::info!("starting fuzzing scheduler");

    let queue = Arc::new(TaskQueue::new());
    let mut states = Vec::new();
    let mut seen: fuzzmill_core::HashSet<(String, String)> = fuzzmill_core::HashSet::default();
    for pkg in &config.fuzz.pkgs_path {
        let targets = list_fuzz_targets(&config.project.src_dir, pkg, token)
            .with_context(|| format!("failed to list fuzz targets for package {:?}", pkg))?;
        for target in targets {
            // a package listed twice must not fuzz its targets twice
            if !seen.insert((pkg.clone(), target.clone())) {
                continue;
            }
            states.push(TargetState {
                package: pkg.clone(),
                target: target.clone(),
            });
            queue.enqueue(Task::new(pkg.clone(), target));
        }
    }

    let total_targets = queue.len();
    if total_targets == 0 {
        anyhow::bail!("no fuzz targets found; please add some fuzz targets");
    }

    let task_timeout = per_target_timeout(
        config.fuzz.sync_frequency,
        config.fuzz.num_workers,
        total_targets,
    );
    if task_timeout.is_zero() {
        anyhow::bail!("invalid fuzz duration: 0s");
    }
    log::info!(
        "{} fuzz targets, per-target timeout {:?}",
        total_targets,
        task_timeout
    );

    // one master index touch per cycle, before any worker starts
    report::update_master(
        &config.project.report_dir,
        &config.project.repo_name,
        &states,
    )
    .context("failed to update master report index")?;

    let first_err: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
    let mut handles = Vec::with_capacity(config.fuzz.num_workers);
    for id in 1..=config.fuzz.num_workers {
        let worker = Worker {
            id,
            config: Arc::clone(config),
            queue: Arc::clone(&queue),
            token: token.clone(),
            task_timeout,
            minimize,
            stats: Arc::clone(stats),
        };
        let token = token.clone();
        let first_err = Arc::clone(&first_err);
        let handle = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                worker_log::set_worker_id(worker.id);
                if let Err(e) = worker.run() {
                    let mut slot = first_err.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    token.cancel();
                }
            })
            .expect("failed to spawn worker thread");
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }
    if let Some(e) = first_err.lock().unwrap().take() {
        return Err(e).context("one or more workers failed");
    }

    log::info!("all fuzz targets processed successfully in this cycle");
    Ok(())
}

/// Ask the build toolchain for the test functions matching the fuzz prefix.
pub fn list_fuzz_targets(
    src_dir: &Path,
    pkg: &str,
    token: &CancelToken,
) -> anyhow::Result<Vec<String>> {
    log::info!("discovering fuzz targets in package {}", pkg);
    let pkg_dir = src_dir.join(pkg);
    let output = Command::new("go")
        .args(["test", "-list=^Fuzz", "."])
        .current_dir(&pkg_dir)
        .output()
        .with_context(|| format!("failed to run go test -list in {}", pkg_dir.display()))?;

    if !output.status.success() && !token.is_canceled() {
        anyhow::bail!(
            "go test -list failed for {:?}: {}",
            pkg,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let targets = parse_fuzz_list(&String::from_utf8_lossy(&output.stdout));
    if targets.is_empty() {
        log::warn!("no valid fuzz targets found in package {}", pkg);
    }
    Ok(targets)
}

/// `go test -list` prints one function per line plus a trailing summary
/// (`ok <pkg> <time>`); only the fuzz functions matter.
fn parse_fuzz_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Fuzz"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzz_list_ignores_summary_lines() {
        let stdout = "FuzzReverseString\nFuzzParseComplex\nok  \tstringutils\t0.01s\n";
        assert_eq!(
            parse_fuzz_list(stdout),
            vec!["FuzzReverseString".to_string(), "FuzzParseComplex".to_string()]
        );
        assert!(parse_fuzz_list("ok  \tstringutils\t0.01s\n").is_empty());
        assert!(parse_fuzz_list("").is_empty());
    }
}
