//! The thread/scheduler collaborator.
//!
//! The cache's periodic writer and per-access read-ahead helper are
//! long-lived tasks interacting with the cache through the same public
//! API used by foreground code; no special privileges, only the cache
//! lock. This module supplies the one concrete `Scheduler` the rest of
//! the crate is built and tested against: real OS threads.

use std::thread;
use std::time::Duration;

use crate::param::TIMER_HZ;

/// Spawns named background work and can sleep the calling thread for a
/// number of timer ticks. An abstract collaborator; this crate only
/// ever uses the one implementation below, but keeping it behind a
/// trait keeps [`Cache`](crate::cache::Cache) testable without actually
/// waiting on wall-clock sleeps if an embedder wants to supply a
/// deterministic fake.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `entry` on a new, detached thread named `name`.
    fn spawn(&self, name: &str, entry: Box<dyn FnOnce() + Send>);

    /// Block the calling thread for `ticks` ticks of [`TIMER_HZ`].
    fn sleep(&self, ticks: u64);
}

/// `Scheduler` backed by real OS threads and wall-clock sleeps.
#[derive(Default, Clone, Copy)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn spawn(&self, name: &str, entry: Box<dyn FnOnce() + Send>) {
        let builder = thread::Builder::new().name(name.to_owned());
        // A background task outliving its spawn site is the whole point
        // of fire-and-forget read-ahead and the periodic writer; join
        // handles are deliberately dropped.
        let _ = builder.spawn(entry);
    }

    fn sleep(&self, ticks: u64) {
        let millis = ticks.saturating_mul(1000) / TIMER_HZ.max(1);
        thread::sleep(Duration::from_millis(millis));
    }
}
