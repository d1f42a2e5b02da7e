use fuzzmill_core::util::CancelToken;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::sleep;
use std::time::Duration;

/// Process-wide counters, printed periodically by a background thread.
#[derive(Debug, Default)]
pub struct Stats {
    cycles: AtomicU64,
    targets_fuzzed: AtomicU64,
    crashes: AtomicU64,
    issues_filed: AtomicU64,
    issues_closed: AtomicU64,
    corpus_removed: AtomicU64,
    uploads: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_targets_fuzzed(&self) {
        self.targets_fuzzed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_crashes(&self) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_issues_filed(&self) {
        self.issues_filed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_issues_closed(&self) {
        self.issues_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_corpus_removed(&self, n: u64) {
        self.corpus_removed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_uploads(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self, interval: Duration, token: &CancelToken) {
        while !token.is_canceled() {
            sleep(interval);
            log::info!(
                "cycles: {}, targets: {}, crashes: {}, issues filed/closed: {}/{}, corpus removed: {}, uploads: {}",
                self.cycles.load(Ordering::Relaxed),
                self.targets_fuzzed.load(Ordering::Relaxed),
                self.crashes.load(Ordering::Relaxed),
                self.issues_filed.load(Ordering::Relaxed),
                self.issues_closed.load(Ordering::Relaxed),
                self.corpus_removed.load(Ordering::Relaxed),
                self.uploads.load(Ordering::Relaxed),
            );
        }
    }
}
