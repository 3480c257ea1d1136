//! Progress bar for worker runs.
//!
//! Draws an indicatif bar on stderr when it is a terminal. Otherwise nothing is
//! drawn and the `[n/m]` log lines stand on their own.

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stderr is connected to a terminal.
pub fn is_tty() -> bool {
    console::Term::stderr().is_term()
}

pub struct ProgressReporter {
    total: usize,
    done: usize,
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
}

impl ProgressReporter {
    /// A bar over `total` packages, drawn only on a terminal.
    pub fn new(total: usize) -> Self {
        let progress_bar = is_tty().then(|| {
            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{bar:30} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            pb
        });

        Self {
            total,
            done: 0,
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// Never draws, regardless of the terminal.
    #[allow(dead_code)]
    pub fn silent(total: usize) -> Self {
        Self {
            total,
            done: 0,
            progress_bar: None,
            start_time: Instant::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn done(&self) -> usize {
        self.done
    }

    /// `done` packages have finished, the latest being `label`.
    pub fn update(&mut self, done: usize, label: &str) {
        self.done = done;
        if let Some(pb) = &self.progress_bar {
            pb.set_position(done as u64);
            pb.set_message(label.to_string());
        }
    }

    /// Run `f` with the bar hidden so log lines do not tear it.
    pub fn suspend<F: FnOnce()>(&self, f: F) {
        match &self.progress_bar {
            Some(pb) => pb.suspend(f),
            None => f(),
        }
    }

    /// Clear the bar and return the elapsed time.
    pub fn finish(self) -> Duration {
        if let Some(pb) = self.progress_bar {
            pb.finish_and_clear();
        }
        self.start_time.elapsed()
    }
}
