//! Terminal progress rendering for downloads.
//!
//! Implements the library's display-only progress seam with indicatif: one
//! task counter at the top, transient per-file byte bars below it. Per-file
//! bars disappear on completion so only in-flight transfers are visible.

use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use provider_mirror::progress::{FileBar, ProgressObserver};

const MAX_NAME_WIDTH: usize = 35;

pub struct TerminalProgress {
    multi: MultiProgress,
    total: Mutex<Option<ProgressBar>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            total: Mutex::new(None),
        }
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for TerminalProgress {
    fn add_total_bar(&self, total: u64) {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::with_template("{prefix:>5} [{bar:40}] {pos}/{len} {percent:>3}%")
                .expect("valid progress template")
                .progress_chars("=> "),
        );
        bar.set_prefix("Total");
        *self.total.lock().expect("total bar lock") = Some(bar);
    }

    fn step_total(&self) {
        if let Some(bar) = self.total.lock().expect("total bar lock").as_ref() {
            bar.inc(1);
        }
    }

    fn add_file_bar(&self, name: &str, size: u64) -> Box<dyn FileBar> {
        let bar = self.multi.add(ProgressBar::new(size.max(1)));
        bar.set_style(
            ProgressStyle::with_template("{msg} {bytes:>9}/{total_bytes:9} {bytes_per_sec:>11}")
                .expect("valid progress template"),
        );
        bar.set_message(truncate_name(name));
        Box::new(TerminalFileBar { bar })
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        if let Some(bar) = self.total.lock().expect("total bar lock").take() {
            bar.finish_and_clear();
        }
    }
}

struct TerminalFileBar {
    bar: ProgressBar,
}

impl FileBar for TerminalFileBar {
    fn step(&self, n: u64) {
        self.bar.inc(n);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn abandon(&self) {
        self.bar.finish_and_clear();
    }
}

fn truncate_name(name: &str) -> String {
    if name.chars().count() <= MAX_NAME_WIDTH {
        return format!("{:<width$}", name, width = MAX_NAME_WIDTH);
    }
    let kept: String = name.chars().take(MAX_NAME_WIDTH - 3).collect();
    format!("{kept}...")
}
