//! Progress reporting seam.
//!
//! The downloader feeds per-file byte counters and a total task counter into
//! an observer; the observer is display-only and must never sit on the
//! critical path. The terminal implementation lives in the CLI crate; tests
//! and non-interactive runs use [`NoopProgress`].

use std::sync::Arc;

/// Observes download progress across a build.
pub trait ProgressObserver: Send + Sync {
    /// Announces the total number of download tasks.
    fn add_total_bar(&self, total: u64);

    /// Marks one task as finished (successfully or not).
    fn step_total(&self);

    /// Starts a per-file byte counter. `size` is the expected length, or 0
    /// when unknown.
    fn add_file_bar(&self, name: &str, size: u64) -> Box<dyn FileBar>;
}

/// Byte counter for a single in-flight download.
pub trait FileBar: Send {
    /// Advances the counter by `n` bytes.
    fn step(&self, n: u64);

    /// Completes the counter.
    fn finish(&self);

    /// Drops the counter after a failed or aborted download.
    fn abandon(&self);
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {
    fn add_total_bar(&self, _total: u64) {}

    fn step_total(&self) {}

    fn add_file_bar(&self, _name: &str, _size: u64) -> Box<dyn FileBar> {
        Box::new(NoopFileBar)
    }
}

struct NoopFileBar;

impl FileBar for NoopFileBar {
    fn step(&self, _n: u64) {}
    fn finish(&self) {}
    fn abandon(&self) {}
}

impl<T: ProgressObserver + ?Sized> ProgressObserver for Arc<T> {
    fn add_total_bar(&self, total: u64) {
        (**self).add_total_bar(total)
    }

    fn step_total(&self) {
        (**self).step_total()
    }

    fn add_file_bar(&self, name: &str, size: u64) -> Box<dyn FileBar> {
        (**self).add_file_bar(name, size)
    }
}
