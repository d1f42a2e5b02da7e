//! Wrappers around fuzzmill's external collaborators: the source repository,
//! the crash issue tracker and the corpus/report object store. Interfaces
//! are deliberately narrow; nothing here knows about scheduling or workers.

use once_cell::sync::Lazy;
use tokio::runtime::Runtime;

pub mod git;
pub mod github;
pub mod store;

/// Shared runtime for the async S3 client. Everything else in the process
/// is plain threads, so the runtime stays an implementation detail of this
/// crate.
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

pub(crate) fn runtime() -> &'static Runtime {
    &RUNTIME
}
