//! The outer cycle loop: fetch, hydrate, schedule under a deadline, settle,
//! persist, repeat.

use crate::config::Config;
use crate::scheduler;
use crate::stats::Stats;
use anyhow::Context;
use fuzzmill_core::util::{cycle_grace, sanitize_url, CancelToken};
use fuzzmill_remote::git;
use fuzzmill_remote::store::ObjectStore;
use std::fs;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(200);

enum CycleEnd {
    Completed,
    Interrupted,
}

/// Run fuzzing cycles until the parent token is canceled, a fatal error
/// occurs, or the configured iteration cap is reached.
pub fn run_cycles(
    config: Arc<Config>,
    parent: CancelToken,
    stats: Arc<Stats>,
) -> anyhow::Result<()> {
    let mut iteration: u64 = 0;
    let mut last_minimize = Instant::now();

    loop {
        if parent.is_canceled() {
            log::info!("shutdown requested; not starting a new cycle");
            return Ok(());
        }
        iteration += 1;

        let minimize = !config.fuzz.corpus_minimize_interval.is_zero()
            && last_minimize.elapsed() >= config.fuzz.corpus_minimize_interval;
        if minimize {
            log::info!("running a corpus minimization cycle");
        }

        match run_one_cycle(&config, &parent, minimize, &stats)? {
            CycleEnd::Interrupted => {
                log::info!("shutdown initiated during fuzzing cycle; performing final cleanup");
                return Ok(());
            }
            CycleEnd::Completed => {
                stats.inc_cycles();
                if minimize {
                    last_minimize = Instant::now();
                }
            }
        }

        if config.fuzz.iterations != 0 && iteration >= config.fuzz.iterations {
            log::info!("iteration cap {} reached; shutting down", config.fuzz.iterations);
            return Ok(());
        }
    }
}

fn run_one_cycle(
    config: &Arc<Config>,
    parent: &CancelToken,
    minimize: bool,
    stats: &Arc<Stats>,
) -> anyhow::Result<CycleEnd> {
    cleanup_cycle_dirs(config);

    log::info!(
        "cloning project repository {} into {}",
        sanitize_url(&config.project.src_repo),
        config.project.src_dir.display()
    );
    if let Err(e) = git::clone(&config.project.src_repo, &config.project.src_dir, parent) {
        if parent.is_canceled() {
            return Ok(CycleEnd::Interrupted);
        }
        return Err(e).context("failed to clone project repository");
    }

    let store = ObjectStore::new(
        config.project.s3_bucket.clone(),
        config.project.corpus_key.clone(),
        config.project.corpus_dir.clone(),
        config.project.report_dir.clone(),
    );
    if let Err(e) = store.hydrate(parent) {
        if parent.is_canceled() {
            return Ok(CycleEnd::Interrupted);
        }
        return Err(e).context("failed to hydrate corpus and reports");
    }

    // The scheduler gets its own token so a cycle can die without taking
    // the daemon with it.
    let cycle_token = parent.child();
    let (tx, rx) = mpsc::channel();
    {
        let config = Arc::clone(config);
        let token = cycle_token.clone();
        let stats = Arc::clone(stats);
        thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || {
                let result = scheduler::schedule_fuzzing(&config, &token, minimize, &stats);
                let _ = tx.send(result);
            })
            .expect("failed to spawn scheduler thread");
    }

    let grace = cycle_grace(config.fuzz.sync_frequency);
    let deadline = Instant::now() + config.fuzz.sync_frequency + grace;

    // first-wins wait over {scheduler result, deadline, parent cancel}
    loop {
        if parent.is_canceled() {
            cycle_token.cancel();
            let _ = rx.recv();
            return Ok(CycleEnd::Interrupted);
        }
        if Instant::now() >= deadline {
            cycle_token.cancel();
            match rx.recv() {
                Ok(Err(e)) => return Err(e).context("fuzzing cycle failed"),
                Ok(Ok(())) => {}
                Err(_) => anyhow::bail!("scheduler exited without reporting a result"),
            }
            log::info!("cycle duration complete; initiating cleanup");
            break;
        }
        match rx.recv_timeout(POLL) {
            Ok(Ok(())) => {
                log::info!("all workers completed early; cleaning up cycle");
                break;
            }
            Ok(Err(e)) => {
                cycle_token.cancel();
                return Err(e).context("fuzzing cycle failed");
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                cycle_token.cancel();
                anyhow::bail!("scheduler exited without reporting a result");
            }
        }
    }

    // a cancellation racing the settle must still skip the upload
    if parent.is_canceled() {
        return Ok(CycleEnd::Interrupted);
    }
    store
        .persist()
        .context("failed to upload corpus and reports")?;
    stats.inc_uploads();
    Ok(CycleEnd::Completed)
}

/// Every cycle begins with project, corpus and reports freshly
/// materialized; whatever the previous cycle left behind goes first.
fn cleanup_cycle_dirs(config: &Config) {
    for dir in [
        &config.project.src_dir,
        &config.project.corpus_dir,
        &config.project.report_dir,
    ] {
        if let Err(e) = fs::remove_dir_all(dir) {
            if e.kind() != io::ErrorKind::NotFound {
                log::error!("cycle cleanup failed for {}: {}", dir.display(), e);
            }
        }
    }
}
