//! Progress callback plumbing (§6) shared by the Anonymization and Extraction Engines.
//!
//! The original system exposes progress as a plain callback invoked from the worker loop; here
//! that becomes a boxed `Fn` trait object, so either engine can report through the same
//! rate-limited reporter without generic parameters leaking into its orchestration structs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `(processed, total, seenSubjects)` — `seenSubjects` is `None` for the Anonymization Engine,
/// which reports file counts only, and `Some(n)` for the Extraction Engine (§4.7).
pub type ProgressCallback = Arc<dyn Fn(u64, u64, Option<u64>) + Send + Sync>;

/// Rate-limits calls into a [`ProgressCallback`] so a tight per-file loop doesn't hammer it.
/// Monotonic: `processed` never decreases across calls from the same reporter.
pub struct ProgressReporter {
    callback: ProgressCallback,
    total: u64,
    processed: AtomicU64,
    min_interval: Duration,
    last_emit: std::sync::Mutex<Instant>,
}

impl ProgressReporter {
    pub fn new(callback: ProgressCallback, total: u64, min_interval: Duration) -> Self {
        ProgressReporter {
            callback,
            total,
            processed: AtomicU64::new(0),
            min_interval,
            last_emit: std::sync::Mutex::new(Instant::now() - min_interval),
        }
    }

    /// Advance the processed count by `delta` and emit if the rate limit allows, or if this call
    /// reaches `total` (always emit the final tick).
    pub fn advance(&self, delta: u64, seen_subjects: Option<u64>) {
        let processed = self.processed.fetch_add(delta, Ordering::Relaxed) + delta;
        let mut last_emit = self.last_emit.lock().unwrap();
        let now = Instant::now();
        if processed >= self.total || now.duration_since(*last_emit) >= self.min_interval {
            *last_emit = now;
            (self.callback)(processed, self.total, seen_subjects);
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn final_tick_always_emits_even_within_rate_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let reporter = ProgressReporter::new(
            Arc::new(move |_p, _t, _s| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
            10,
            Duration::from_secs(3600),
        );
        reporter.advance(1, None);
        reporter.advance(9, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(reporter.processed(), 10);
    }
}
