//! A worker drains the task queue: for each target it first re-verifies the
//! target's open crash issues, then runs one sandboxed fuzz session, routes
//! the outcome (crash report or coverage record) and, on minimization
//! cycles, prunes the target's corpus.

use crate::config::Config;
use crate::stats::Stats;
use crate::{worker_debug, worker_info, worker_warn};
use anyhow::Context;
use fuzzmill_core::coverage;
use fuzzmill_core::crash::{self, ReportInput};
use fuzzmill_core::minimize::minimize_corpus;
use fuzzmill_core::parse::{FuzzCrash, OutputProcessor};
use fuzzmill_core::queue::{Task, TaskQueue};
use fuzzmill_core::report;
use fuzzmill_core::util::{ensure_dir, sha256_short, CancelToken};
use fuzzmill_remote::github::GitHubRepo;
use fuzzmill_sandbox::{docker, k8s, SandboxPaths, SandboxRunner, SandboxSpec};
use std::fs;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Startup slack granted on top of the per-target budget, covering sandbox
/// creation and image spin-up.
pub const FUZZ_GRACE: Duration = Duration::from_secs(20);

const POLL: Duration = Duration::from_millis(200);

pub struct Worker {
    pub id: usize,
    pub config: Arc<Config>,
    pub queue: Arc<TaskQueue>,
    pub token: CancelToken,
    pub task_timeout: Duration,
    pub minimize: bool,
    pub stats: Arc<Stats>,
}

enum FuzzOutcome {
    Crash(FuzzCrash),
    Clean,
    Canceled,
}

enum Replay {
    StillCrashes,
    Clean,
    Canceled,
}

impl Worker {
    pub fn run(&self) -> anyhow::Result<()> {
        loop {
            if self.token.is_canceled() {
                return Ok(());
            }
            let Some(task) = self.queue.dequeue() else {
                worker_info!("no more tasks in queue; stopping");
                return Ok(());
            };

            worker_info!(
                "starting fuzz target {}/{} (budget {:?})",
                task.package,
                task.target,
                self.task_timeout,
            );
            if let Err(e) = self.process_task(&task) {
                // errors racing a cancellation are expected noise
                if self.token.is_canceled() {
                    worker_debug!("ignoring error after cancellation: {:#}", e);
                    return Ok(());
                }
                return Err(e).with_context(|| {
                    format!("fuzz target {}/{} failed", task.package, task.target)
                });
            }
            worker_info!("completed fuzz target {}/{}", task.package, task.target);
        }
    }

    fn process_task(&self, task: &Task) -> anyhow::Result<()> {
        self.verify_open_issues(task)
            .context("verifying open crash issues")?;
        if self.token.is_canceled() {
            return Ok(());
        }

        match self.execute_fuzz(task)? {
            FuzzOutcome::Canceled => return Ok(()),
            FuzzOutcome::Crash(fuzz_crash) => return self.handle_crash(task, fuzz_crash),
            FuzzOutcome::Clean => {}
        }
        if self.token.is_canceled() {
            return Ok(());
        }
        self.stats.inc_targets_fuzzed();

        let pkg_dir = self.config.project.src_dir.join(&task.package);
        let corpus_dir = self.host_corpus_dir(task);
        let seed_adds = coverage::seed_adds(&pkg_dir, &corpus_dir, &task.target)
            .context("counting seed inputs")?;

        self.record_coverage(task, seed_adds)
            .context("recording coverage")?;

        if self.minimize && !self.token.is_canceled() {
            let outcome = minimize_corpus(&pkg_dir, &corpus_dir, &task.target, seed_adds)
                .context("minimizing corpus")?;
            self.stats.add_corpus_removed(outcome.removed as u64);
        }
        Ok(())
    }

    /// Replay the saved input of every open crash issue of this target and
    /// close the ones that no longer reproduce.
    fn verify_open_issues(&self, task: &Task) -> anyhow::Result<()> {
        let tracker = GitHubRepo::from_url(&self.config.fuzz.crash_repo)
            .context("initializing issue tracker client")?;
        let title = crash::verify_title(&task.package, &task.target);
        let issues = tracker.list_open_issues(&title)?;

        for issue in issues {
            if self.token.is_canceled() {
                return Ok(());
            }
            let Some(body) = issue.body.as_deref() else {
                continue;
            };
            let input = match crash::parse_report(body) {
                None => {
                    worker_info!(
                        "no failing testcase in issue body; skipping {}",
                        issue.html_url
                    );
                    continue;
                }
                Some(ReportInput::SeedCorpus) => {
                    worker_info!(
                        "seed corpus crash; manual verification required: {}",
                        issue.html_url
                    );
                    continue;
                }
                Some(ReportInput::Input(input)) => input,
            };

            let input_id = sha256_short(&input);
            let testdata_dir = self.project_testdata_dir(task).join(&task.target);
            ensure_dir(&testdata_dir).context("create testdata directory")?;
            let input_path = testdata_dir.join(&input_id);
            fs::write(&input_path, &input).context("writing failing input")?;

            let replay = self.replay_input(task, &input_id);
            // the replay input must not linger in the project tree
            let _ = fs::remove_file(&input_path);

            match replay? {
                Replay::Canceled => return Ok(()),
                Replay::StillCrashes => {
                    worker_info!(
                        "crash still reproducible; keeping issue open: {}",
                        issue.html_url
                    );
                }
                Replay::Clean => {
                    tracker
                        .close_issue(issue.number)
                        .with_context(|| format!("closing issue #{}", issue.number))?;
                    self.stats.inc_issues_closed();
                    worker_info!(
                        "crash no longer reproducible; closed issue {}",
                        issue.html_url
                    );
                }
            }
        }
        Ok(())
    }

    /// Run the target's test binary against exactly one saved input inside
    /// a sandbox. A clean exit means the crash is gone.
    fn replay_input(&self, task: &Task, input_id: &str) -> anyhow::Result<Replay> {
        let (mut runner, paths) = self.make_runner(task);
        let command = vec![
            "go".to_string(),
            "test".to_string(),
            format!("-run=^{}$/{}", task.target, input_id),
            "-parallel=1".to_string(),
        ];
        let spec = SandboxSpec {
            project_dir: self.config.project.src_dir.clone(),
            corpus_dir: self.host_corpus_dir(task),
            work_dir: paths.work_dir,
            command,
        };

        if let Err(e) = runner.start(&spec) {
            if self.token.is_canceled() {
                return Ok(Replay::Canceled);
            }
            return Err(e).context("failed to start verification sandbox");
        }
        let logs = runner.stream_logs().context("attaching to sandbox logs")?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = drain(logs);
            let _ = tx.send(());
        });

        let deadline = Instant::now() + self.task_timeout + FUZZ_GRACE;
        loop {
            if self.token.is_canceled() {
                runner.stop();
                return Ok(Replay::Canceled);
            }
            if Instant::now() >= deadline {
                runner.stop();
                worker_warn!("verification replay timed out; keeping issue open");
                return Ok(Replay::StillCrashes);
            }
            match rx.recv_timeout(POLL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }

        match runner.wait() {
            Ok(status) if status.success() => Ok(Replay::Clean),
            Ok(_) => Ok(Replay::StillCrashes),
            Err(e) => {
                if self.token.is_canceled() {
                    Ok(Replay::Canceled)
                } else {
                    Err(e).context("waiting for verification sandbox")
                }
            }
        }
    }

    /// One sandboxed fuzz session. The budget elapsing is a normal end: the
    /// engine simply keeps fuzzing until the sandbox is stopped.
    fn execute_fuzz(&self, task: &Task) -> anyhow::Result<FuzzOutcome> {
        let backend = if self.config.fuzz.in_cluster {
            "kubernetes"
        } else {
            "docker"
        };
        worker_info!(
            "executing fuzz target {}/{} via {}",
            task.package,
            task.target,
            backend,
        );

        let corpus_dir = self.host_corpus_dir(task);
        // pre-create so the unprivileged sandbox user can write inputs
        ensure_dir(&corpus_dir).context("create corpus directory")?;

        let (mut runner, paths) = self.make_runner(task);
        let command = vec![
            "go".to_string(),
            "test".to_string(),
            format!("-fuzz=^{}$", task.target),
            "-parallel=1".to_string(),
            format!("-test.fuzzcachedir={}", paths.corpus_dir),
        ];
        let spec = SandboxSpec {
            project_dir: self.config.project.src_dir.clone(),
            corpus_dir,
            work_dir: paths.work_dir,
            command,
        };

        if let Err(e) = runner.start(&spec) {
            if self.token.is_canceled() {
                return Ok(FuzzOutcome::Canceled);
            }
            return Err(e).context("failed to start fuzz sandbox");
        }
        let logs = runner.stream_logs().context("attaching to sandbox logs")?;

        let processor = OutputProcessor::new(self.project_testdata_dir(task));
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(logs);
            let result = processor.process(&mut reader);
            let _ = tx.send(result);
        });

        let deadline = Instant::now() + self.task_timeout + FUZZ_GRACE;
        loop {
            if self.token.is_canceled() {
                runner.stop();
                return Ok(FuzzOutcome::Canceled);
            }
            if Instant::now() >= deadline {
                // budget exhausted; whatever the engine found is in the corpus
                runner.stop();
                return Ok(FuzzOutcome::Clean);
            }
            match rx.recv_timeout(POLL) {
                Ok(Ok(Some(fuzz_crash))) => {
                    let _ = runner.wait();
                    return Ok(FuzzOutcome::Crash(fuzz_crash));
                }
                Ok(Ok(None)) => {
                    return match runner.wait() {
                        Ok(status) if status.success() => Ok(FuzzOutcome::Clean),
                        Ok(status) => {
                            if self.token.is_canceled() {
                                Ok(FuzzOutcome::Canceled)
                            } else {
                                anyhow::bail!("fuzz execution failed: {:?}", status)
                            }
                        }
                        Err(e) => {
                            if self.token.is_canceled() {
                                Ok(FuzzOutcome::Canceled)
                            } else {
                                Err(e).context("waiting for fuzz sandbox")
                            }
                        }
                    };
                }
                Ok(Err(e)) => {
                    if self.token.is_canceled() {
                        return Ok(FuzzOutcome::Canceled);
                    }
                    return Err(e).context("failed to process fuzz output stream");
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    if self.token.is_canceled() {
                        return Ok(FuzzOutcome::Canceled);
                    }
                    anyhow::bail!("fuzz output stream closed unexpectedly");
                }
            }
        }
    }

    /// File (or dedup against) a crash issue, then scrub the failing inputs
    /// the engine wrote into the project tree so the next run of this tree
    /// is unbiased.
    fn handle_crash(&self, task: &Task, fuzz_crash: FuzzCrash) -> anyhow::Result<()> {
        self.stats.inc_crashes();
        let fingerprint = crash::fingerprint(&fuzz_crash.failure_site);
        let title = crash::issue_title(&fingerprint, &task.package, &task.target);
        let body = crash::format_report(
            &fuzz_crash.error_logs,
            fuzz_crash.failing_input.as_deref(),
        );

        let tracker = GitHubRepo::from_url(&self.config.fuzz.crash_repo)
            .context("initializing issue tracker client")?;
        if tracker
            .issue_exists(&title)
            .context("checking existing issues")?
        {
            worker_info!("fuzz crash already reported ({})", fingerprint);
        } else {
            tracker.create_issue(&title, &body).context("creating issue")?;
            self.stats.inc_issues_filed();
        }

        let failing_dir = self.project_testdata_dir(task).join(&task.target);
        if let Err(e) = fs::remove_dir_all(&failing_dir) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e)
                    .with_context(|| format!("failing input cleanup {}", failing_dir.display()));
            }
        }
        Ok(())
    }

    /// Measure coverage bits, render the daily profile report and record
    /// both in the target's history.
    fn record_coverage(&self, task: &Task, seed_adds: usize) -> anyhow::Result<()> {
        let pkg_dir = self.config.project.src_dir.join(&task.package);
        let corpus_dir = self.host_corpus_dir(task);
        let bits = coverage::measure(&pkg_dir, &corpus_dir, &task.target, seed_adds)?;

        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.render_daily_report(task, &date)?;

        let daily_rel = format!("{}/{}.html", task.target, date);
        let updated = report::update_target_history(
            &self.config.project.report_dir,
            &task.package,
            &task.target,
            &date,
            bits,
            &daily_rel,
        )?;
        if updated {
            worker_info!(
                "recorded {} coverage bits for {}/{}",
                bits,
                task.package,
                task.target,
            );
        }
        Ok(())
    }

    /// Run the target once as a plain test over the corpus with profiling
    /// enabled and render the HTML line report for today.
    fn render_daily_report(&self, task: &Task, date: &str) -> anyhow::Result<()> {
        let pkg_dir = self.config.project.src_dir.join(&task.package);
        let corpus_src = self.host_corpus_dir(task).join(&task.target);
        let corpus_dst = self.project_testdata_dir(task).join(&task.target);
        fuzzmill_core::util::copy_dir_files(&corpus_src, &corpus_dst)
            .context("corpus copy failed")?;

        let test_args = vec![
            "test".to_string(),
            format!("-run=^{}$", task.target),
            "-coverprofile=coverage.out".to_string(),
            "-covermode=count".to_string(),
        ];
        coverage::run_go(&pkg_dir, &test_args, &[]).context("coverage profile run failed")?;

        let daily_dir = self
            .config
            .project
            .report_dir
            .join("targets")
            .join(&task.package)
            .join(&task.target);
        ensure_dir(&daily_dir).context("create daily report directory")?;
        let daily_path = daily_dir.join(format!("{}.html", date));

        let cover_args = vec![
            "tool".to_string(),
            "cover".to_string(),
            "-html=coverage.out".to_string(),
            "-o".to_string(),
            daily_path.display().to_string(),
        ];
        coverage::run_go(&pkg_dir, &cover_args, &[]).context("cover report render failed")?;

        // leave the project tree the way the next target expects it
        let _ = fs::remove_file(pkg_dir.join("coverage.out"));
        if let Err(e) = fs::remove_dir_all(&corpus_dst) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e)
                    .with_context(|| format!("corpus cleanup {}", corpus_dst.display()));
            }
        }
        Ok(())
    }

    /// `corpus_root/<pkg>/testdata/fuzz`, the per-package corpus subtree.
    fn host_corpus_dir(&self, task: &Task) -> PathBuf {
        self.config
            .project
            .corpus_dir
            .join(&task.package)
            .join("testdata")
            .join("fuzz")
    }

    /// `<project>/<pkg>/testdata/fuzz`, where the engine drops failing
    /// inputs.
    fn project_testdata_dir(&self, task: &Task) -> PathBuf {
        self.config
            .project
            .src_dir
            .join(&task.package)
            .join("testdata")
            .join("fuzz")
    }

    fn make_runner(&self, task: &Task) -> (Box<dyn SandboxRunner>, SandboxPaths) {
        if self.config.fuzz.in_cluster {
            let paths = k8s::path_map(
                &self.config.project.src_dir,
                &self.host_corpus_dir(task),
                &task.package,
            );
            (
                Box::new(k8s::K8sJobRunner::new(self.config.fuzz.namespace.clone())),
                paths,
            )
        } else {
            (
                Box::new(docker::DockerRunner::new()),
                docker::path_map(&task.package),
            )
        }
    }
}

fn drain<R: Read>(mut r: R) -> io::Result<u64> {
    io::copy(&mut r, &mut io::sink())
}
