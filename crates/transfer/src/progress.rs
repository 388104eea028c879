use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::sync::{read, write};

/// Point-in-time view of one tracked transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub loaded: u64,
    pub total: u64,
    pub percentage: f64,
    /// Average speed since the transfer started.
    pub bytes_per_second: f64,
    /// Estimated time remaining; `None` until some bytes have moved.
    pub eta: Option<Duration>,
}

/// Metrics recorded when a transfer finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMetrics {
    pub bytes: u64,
    pub duration: Duration,
    pub average_bytes_per_second: f64,
}

struct Entry {
    loaded: u64,
    total: u64,
    started_at: Instant,
}

impl Entry {
    fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.loaded as f64 / self.total as f64 * 100.0).min(100.0)
    }

    fn bytes_per_second(&self) -> f64 {
        let elapsed = self.started_at.elapsed();
        if elapsed.is_zero() {
            return 0.0;
        }
        self.loaded as f64 / elapsed.as_secs_f64()
    }
}

/// Aggregates byte-level progress of many concurrent transfers.
///
/// Progress per transfer only moves forward: an update reporting fewer bytes
/// than already recorded is discarded, since network callbacks can arrive out
/// of order.
#[derive(Default)]
pub struct ProgressTracker {
    entries: RwLock<HashMap<String, Entry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins tracking `id` at zero bytes, restarting the clock.
    pub fn start(&self, id: &str, total: u64) {
        self.start_at(id, 0, total);
    }

    /// Begins tracking `id` with `loaded` bytes already done (resume).
    pub fn start_at(&self, id: &str, loaded: u64, total: u64) {
        write(&self.entries).insert(
            id.to_string(),
            Entry {
                loaded: loaded.min(total),
                total,
                started_at: Instant::now(),
            },
        );
    }

    /// Records `loaded` of `total` bytes for `id`.
    ///
    /// Returns `false` if the update was discarded because it would move
    /// progress backwards. Unknown ids start being tracked.
    pub fn update(&self, id: &str, loaded: u64, total: u64) -> bool {
        let mut entries = write(&self.entries);
        let entry = entries.entry(id.to_string()).or_insert_with(|| Entry {
            loaded: 0,
            total,
            started_at: Instant::now(),
        });
        if loaded < entry.loaded {
            return false;
        }
        entry.loaded = loaded.min(total);
        entry.total = total;
        true
    }

    /// Returns the percentage (0-100) for `id`.
    pub fn get(&self, id: &str) -> Option<f64> {
        read(&self.entries).get(id).map(Entry::percentage)
    }

    /// Returns loaded/total bytes, speed and ETA for `id`.
    pub fn snapshot(&self, id: &str) -> Option<ProgressSnapshot> {
        let entries = read(&self.entries);
        let entry = entries.get(id)?;
        let bytes_per_second = entry.bytes_per_second();
        let eta = if bytes_per_second > 0.0 {
            let remaining = entry.total.saturating_sub(entry.loaded);
            Some(Duration::from_secs_f64(remaining as f64 / bytes_per_second))
        } else {
            None
        };
        Some(ProgressSnapshot {
            loaded: entry.loaded,
            total: entry.total,
            percentage: entry.percentage(),
            bytes_per_second,
            eta,
        })
    }

    /// Overall progress of several transfers, weighted by size.
    ///
    /// `Σ(progress_i × size_i) / Σ(size_i)`, so a large file's progress is
    /// not drowned out by many small ones. Unknown ids are ignored.
    pub fn batch_progress<S: AsRef<str>>(&self, ids: &[S]) -> f64 {
        let entries = read(&self.entries);
        let (weighted, total) = ids
            .iter()
            .filter_map(|id| entries.get(id.as_ref()))
            .fold((0.0f64, 0u64), |(weighted, total), e| {
                (weighted + e.percentage() * e.total as f64, total + e.total)
            });
        if total == 0 {
            return 0.0;
        }
        weighted / total as f64
    }

    /// Stops tracking `id` and returns its final metrics.
    pub fn record_completion(&self, id: &str) -> Option<CompletionMetrics> {
        let entry = write(&self.entries).remove(id)?;
        let duration = entry.started_at.elapsed();
        let average_bytes_per_second = if duration.is_zero() {
            0.0
        } else {
            entry.loaded as f64 / duration.as_secs_f64()
        };
        Some(CompletionMetrics {
            bytes: entry.loaded,
            duration,
            average_bytes_per_second,
        })
    }

    /// Stops tracking `id` without recording metrics.
    pub fn remove(&self, id: &str) {
        write(&self.entries).remove(id);
    }
}
