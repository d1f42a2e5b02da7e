//! fuzzmill daemon: continuous fuzzing cycles over a Go repository.

#[macro_use]
pub mod worker_log;
pub mod config;
pub mod cycle;
pub mod scheduler;
pub mod stats;
pub mod util;
pub mod worker;

use crate::config::{Config, LOG_FILENAME};
use crate::stats::Stats;
use crate::util::RotatingFile;
use anyhow::Context;
use fuzzmill_core::util::{ensure_dir, CancelToken};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode,
    WriteLogger,
};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const LOG_MAX_SIZE: u64 = 100 * 1024 * 1024;
const LOG_MAX_BACKUPS: usize = 7;
const STATS_INTERVAL: Duration = Duration::from_secs(60);

pub fn boot(mut config: Config) -> anyhow::Result<()> {
    init_logging(&config.log_dir, config.debug).context("failed to initialize logging")?;

    config.check().context("config error")?;
    config.fixup().context("config error")?;

    ignore_sigpipe();

    let parent = CancelToken::new();
    setup_signal_handler(parent.clone());

    let stats = Arc::new(Stats::new());
    {
        let stats = Arc::clone(&stats);
        let token = parent.clone();
        thread::Builder::new()
            .name("stats".to_string())
            .spawn(move || stats.report(STATS_INTERVAL, &token))
            .expect("failed to spawn stats thread");
    }

    let config = Arc::new(config);
    let result = cycle::run_cycles(Arc::clone(&config), parent.clone(), stats);
    parent.cancel();

    match result {
        Ok(()) => {
            log::info!("program exited");
            Ok(())
        }
        Err(e) => {
            log::error!("failed to run fuzzing cycles: {:#}", e);
            Err(e)
        }
    }
}

/// Process-wide log sink: stdout plus a rotating file. Initialized once at
/// startup; the only global state in the program besides the stop token.
fn init_logging(log_dir: &Path, debug: bool) -> anyhow::Result<()> {
    ensure_dir(log_dir).with_context(|| format!("create log dir {}", log_dir.display()))?;
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let log_conf = ConfigBuilder::new().set_time_format_rfc3339().build();
    let file = RotatingFile::open(log_dir.join(LOG_FILENAME), LOG_MAX_SIZE, LOG_MAX_BACKUPS)
        .context("open log file")?;

    CombinedLogger::init(vec![
        TermLogger::new(
            level,
            log_conf.clone(),
            TerminalMode::Stdout,
            ColorChoice::Auto,
        ),
        WriteLogger::new(level, log_conf, file),
    ])
    .context("logger already initialized")
}

/// When our stdout is piped and the reader dies first, writes raise
/// SIGPIPE; shutdown must stay with the SIGINT/SIGTERM handler instead.
fn ignore_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

fn setup_signal_handler(parent: CancelToken) {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS).unwrap();
            if let Some(info) = signals.forever().next() {
                let name = signal_hook::low_level::signal_name(info.signal)
                    .map(str::to_string)
                    .unwrap_or_else(|| info.signal.to_string());
                log::info!("{} received; shutting down gracefully...", name);
            }
            parent.cancel();
        })
        .expect("failed to spawn signal handler thread");
}
