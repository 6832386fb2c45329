// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Stage progress reporting. */

use {
    std::{
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tracing::info,
};

/// Counters for one download stage.
///
/// Workers record completions; a ticker task periodically emits one
/// progress line with counts, throughput, and an ETA.
#[derive(Debug)]
pub struct StageProgress {
    stage: &'static str,
    total_files: usize,
    total_bytes: u64,
    completed: AtomicUsize,
    failed: AtomicUsize,
    bytes: AtomicU64,
    started: Instant,
    finished: AtomicBool,
}

impl StageProgress {
    pub fn new(stage: &'static str, total_files: usize, total_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            stage,
            total_files,
            total_bytes,
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            started: Instant::now(),
            finished: AtomicBool::new(false),
        })
    }

    pub fn record_success(&self, bytes: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failures(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Emit one progress line.
    pub fn emit(&self) {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        let elapsed = self.started.elapsed().as_secs_f64();

        let speed = if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 };

        let eta = if speed > 0.0 && self.total_bytes > bytes {
            format_duration(((self.total_bytes - bytes) as f64 / speed) as u64)
        } else {
            "-".to_string()
        };

        info!(
            "[{}] {}/{} files, {} failed, {}/s, ETA {}",
            self.stage,
            completed + failed,
            self.total_files,
            failed,
            format_bytes(speed as u64),
            eta,
        );
    }

    /// Mark the stage complete and emit the final line.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        let bytes = self.bytes.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);

        info!(
            "[{}] done: {}/{} files, {} failed, {} in {}",
            self.stage,
            self.completed.load(Ordering::Relaxed),
            self.total_files,
            failed,
            format_bytes(bytes),
            format_duration(self.started.elapsed().as_secs()),
        );
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Spawn a task emitting a progress line every `period` until the stage
/// finishes.
pub fn spawn_ticker(
    progress: Arc<StageProgress>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            interval.tick().await;

            if progress.is_finished() {
                break;
            }

            progress.emit();
        }
    })
}

/// Format a byte count with a binary-unit suffix.
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;

    for unit in ["B", "KiB", "MiB", "GiB", "TiB"] {
        if value < 1024.0 {
            return format!("{:.1} {}", value, unit);
        }
        value /= 1024.0;
    }

    format!("{:.1} PiB", value)
}

/// Format a duration in seconds as a compact human-readable string.
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7260), "2h 1m");
    }

    #[test]
    fn counters_accumulate() {
        let progress = StageProgress::new("archive", 3, 300);

        progress.record_success(100);
        progress.record_success(100);
        progress.record_failure();

        assert_eq!(progress.failures(), 1);
        assert_eq!(progress.completed.load(Ordering::Relaxed), 2);
        assert_eq!(progress.bytes.load(Ordering::Relaxed), 200);

        progress.finish();
        assert!(progress.is_finished());
    }
}
