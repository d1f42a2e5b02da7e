//! Worker-scoped log prefixes. Each worker thread registers its id once;
//! the macros below stamp it onto every message without threading the id
//! through call sites.

use std::cell::Cell;

thread_local! {
    static WORKER_ID: Cell<usize> = const { Cell::new(0) };
}

#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|r| r.set(id));
}

#[inline]
pub fn worker_id() -> usize {
    WORKER_ID.with(|r| r.get())
}

#[macro_export]
macro_rules! worker_info {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (
        log::info!(std::concat!("worker-{}: ", $fmt), $crate::worker_log::worker_id() $(, $arg)*)
    )
}

#[macro_export]
macro_rules! worker_warn {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (
        log::warn!(std::concat!("worker-{}: ", $fmt), $crate::worker_log::worker_id() $(, $arg)*)
    )
}

#[macro_export]
macro_rules! worker_debug {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (
        log::debug!(std::concat!("worker-{}: ", $fmt), $crate::worker_log::worker_id() $(, $arg)*)
    )
}
