//! Live progress accounting for offload and verify runs.
//!
//! Workers finish in any order and on any thread, so the counters are plain
//! atomics. Every completion produces one `OffloadProgress` snapshot that is
//! pushed to the caller's channel. Nothing here is persisted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Snapshot sent to the caller after each completed file per destination.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OffloadProgress {
    pub current_file: String,
    pub bytes_copied: u64,
    pub total_bytes: u64,
    pub files_processed: u64,
    pub total_files: u64,
    /// Destination label ("A", "B"), or the target root when verifying
    pub current_destination: String,
    pub estimated_time_remaining: Duration,
    pub throughput_bytes_per_sec: f64,
    pub status: String,
}

impl OffloadProgress {
    /// Percent complete by bytes. Zero total bytes reads as 0%.
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.bytes_copied as f64 * 100.0 / self.total_bytes as f64
        }
    }
}

/// Shared byte/file counters for one run.
#[derive(Debug)]
pub struct ProgressTracker {
    bytes_done: AtomicU64,
    files_done: AtomicU64,
    total_bytes: u64,
    total_files: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total_files: u64, total_bytes: u64) -> Self {
        Self {
            bytes_done: AtomicU64::new(0),
            files_done: AtomicU64::new(0),
            total_bytes,
            total_files,
            started: Instant::now(),
        }
    }

    /// Account for one finished file and return the updated (bytes, files).
    pub fn record(&self, bytes: u64) -> (u64, u64) {
        let bytes_done = self.bytes_done.fetch_add(bytes, Ordering::SeqCst) + bytes;
        let files_done = self.files_done.fetch_add(1, Ordering::SeqCst) + 1;
        (bytes_done, files_done)
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::SeqCst)
    }

    pub fn files_done(&self) -> u64 {
        self.files_done.load(Ordering::SeqCst)
    }

    pub fn total_files(&self) -> u64 {
        self.total_files
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Build a snapshot from counter values returned by [`record`](Self::record).
    pub fn snapshot(
        &self,
        (bytes_done, files_done): (u64, u64),
        current_file: &str,
        destination: &str,
        status: String,
    ) -> OffloadProgress {
        let speed = throughput(bytes_done, self.elapsed());

        OffloadProgress {
            current_file: current_file.to_string(),
            bytes_copied: bytes_done,
            total_bytes: self.total_bytes,
            files_processed: files_done,
            total_files: self.total_files,
            current_destination: destination.to_string(),
            estimated_time_remaining: estimate_remaining(self.total_bytes, bytes_done, speed),
            throughput_bytes_per_sec: speed,
            status,
        }
    }
}

/// Bytes per second over `elapsed`. Zero elapsed time reads as zero speed.
pub fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { bytes as f64 / secs } else { 0.0 }
}

/// Remaining time at the current speed; zero when the speed is unknown.
pub fn estimate_remaining(total_bytes: u64, bytes_done: u64, bytes_per_sec: f64) -> Duration {
    if bytes_per_sec <= 0.0 || !bytes_per_sec.is_finite() {
        return Duration::ZERO;
    }
    let remaining = total_bytes.saturating_sub(bytes_done);
    Duration::from_secs_f64(remaining as f64 / bytes_per_sec)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else {
        format!("{:02}m{:02}s", m, s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_percentage_guards_zero_total() {
        let progress = OffloadProgress::default();
        assert_eq!(progress.percentage(), 0.0);

        let progress = OffloadProgress {
            bytes_copied: 25,
            total_bytes: 100,
            ..Default::default()
        };
        assert_eq!(progress.percentage(), 25.0);
    }

    #[test]
    fn test_estimate_remaining_zero_speed() {
        assert_eq!(estimate_remaining(1000, 0, 0.0), Duration::ZERO);
        assert_eq!(estimate_remaining(1000, 500, 100.0), Duration::from_secs(5));
        assert_eq!(estimate_remaining(1000, 2000, 100.0), Duration::ZERO);
    }

    #[test]
    fn test_throughput_zero_elapsed() {
        assert_eq!(throughput(1024, Duration::ZERO), 0.0);
        assert_eq!(throughput(1024, Duration::from_secs(2)), 512.0);
    }

    #[test]
    fn test_record_accumulates_across_threads() {
        let tracker = Arc::new(ProgressTracker::new(800, 800 * 10));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.record(10);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.files_done(), 800);
        assert_eq!(tracker.bytes_done(), 8000);
    }

    #[test]
    fn test_snapshot_carries_totals() {
        let tracker = ProgressTracker::new(2, 200);
        let counts = tracker.record(100);
        let snap = tracker.snapshot(counts, "A001.mov", "A", "Copied A001.mov".into());

        assert_eq!(snap.bytes_copied, 100);
        assert_eq!(snap.files_processed, 1);
        assert_eq!(snap.total_files, 2);
        assert_eq!(snap.total_bytes, 200);
        assert_eq!(snap.current_destination, "A");
        assert_eq!(snap.percentage(), 50.0);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(52_428_800), "50.00 MB");
        assert_eq!(format_duration(Duration::from_secs(75)), "01m15s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h02m05s");
    }
}
