use clap::Parser;
use fuzzmill_daemon::config::{self, Config, Overrides};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "fuzzmill")]
#[command(version, about = "continuous fuzzing orchestrator for Go repositories")]
struct Settings {
    /// Path to the config file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Git repo URL of the project to fuzz.
    #[arg(long = "project.src-repo")]
    src_repo: Option<String>,

    /// S3 bucket storing the seed corpus and coverage reports.
    #[arg(long = "project.s3-bucket-name")]
    s3_bucket_name: Option<String>,

    /// Fixed workspace directory instead of an ephemeral one.
    #[arg(long = "project.workspace-path")]
    workspace_path: Option<PathBuf>,

    /// Git repository URL where crash issues are filed.
    #[arg(long = "fuzz.crash-repo")]
    crash_repo: Option<String>,

    /// Package path to scan for fuzz targets; repeatable.
    #[arg(long = "fuzz.pkgs-path")]
    pkgs_path: Vec<String>,

    /// Duration of one fuzzing cycle.
    #[arg(long = "fuzz.sync-frequency", value_parser = humantime::parse_duration)]
    sync_frequency: Option<Duration>,

    /// Number of concurrent fuzzing workers.
    #[arg(long = "fuzz.num-workers")]
    num_workers: Option<usize>,

    /// Period between corpus minimization cycles.
    #[arg(long = "fuzz.corpus-minimize-interval", value_parser = humantime::parse_duration)]
    corpus_minimize_interval: Option<Duration>,

    /// Cap on fuzzing cycles; 0 keeps cycling forever.
    #[arg(long = "fuzz.iterations", allow_negative_numbers = true)]
    iterations: Option<i64>,

    /// Run sandboxes as Kubernetes jobs instead of Docker containers.
    #[arg(long = "fuzz.in-cluster")]
    in_cluster: bool,

    /// Kubernetes namespace for fuzz jobs.
    #[arg(long = "fuzz.namespace")]
    namespace: Option<String>,

    /// Directory for the rotating log file.
    #[arg(long = "log.dir")]
    log_dir: Option<PathBuf>,

    /// Debug logging.
    #[arg(long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let config_path = settings
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let file = config::load_file_config(&config_path)?;

    let config = Config::resolve(
        file,
        Overrides {
            src_repo: settings.src_repo,
            s3_bucket_name: settings.s3_bucket_name,
            workspace_path: settings.workspace_path,
            crash_repo: settings.crash_repo,
            pkgs_path: settings.pkgs_path,
            sync_frequency: settings.sync_frequency,
            num_workers: settings.num_workers,
            corpus_minimize_interval: settings.corpus_minimize_interval,
            iterations: settings.iterations,
            in_cluster: settings.in_cluster,
            namespace: settings.namespace,
            log_dir: settings.log_dir,
            debug: settings.debug,
        },
    )?;

    fuzzmill_daemon::boot(config)
}
