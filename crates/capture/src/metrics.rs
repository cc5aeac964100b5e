use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Frames kept for rolling figures: two seconds at 60 Hz.
const WINDOW: usize = 120;

/// Rolling per-frame timing of one stage of the capture path.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use hdcap_capture::prelude::StageMetrics;
///
/// let metrics = StageMetrics::default();
/// metrics.record(Duration::from_millis(2));
/// metrics.record(Duration::from_millis(4));
/// assert_eq!(metrics.total_samples(), 2);
/// assert_eq!(metrics.max_millis(), Some(4.0));
/// ```
#[derive(Clone, Default)]
pub struct StageMetrics(Arc<Mutex<Window>>);

#[derive(Default)]
struct Window {
    recorded: u64,
    samples: VecDeque<Sample>,
}

#[derive(Clone, Copy)]
struct Sample {
    at: Instant,
    took: Duration,
}

impl StageMetrics {
    pub fn record(&self, took: Duration) {
        self.record_at(Instant::now(), took);
    }

    fn record_at(&self, at: Instant, took: Duration) {
        let mut window = self.0.lock();
        window.recorded += 1;
        if window.samples.len() == WINDOW {
            window.samples.pop_front();
        }
        window.samples.push_back(Sample { at, took });
    }

    /// Samples recorded since creation, including those outside the window.
    pub fn total_samples(&self) -> u64 {
        self.0.lock().recorded
    }

    pub fn avg_millis(&self) -> Option<f64> {
        let window = self.0.lock();
        let count = u32::try_from(window.samples.len()).ok().filter(|&n| n > 0)?;
        let sum: Duration = window.samples.iter().map(|s| s.took).sum();
        Some(millis(sum / count))
    }

    pub fn max_millis(&self) -> Option<f64> {
        let window = self.0.lock();
        window.samples.iter().map(|s| s.took).max().map(millis)
    }

    /// Sample rate over the window; `None` until two samples span some time.
    pub fn fps(&self) -> Option<f64> {
        let window = self.0.lock();
        let (first, last) = (window.samples.front()?, window.samples.back()?);
        let span = last.at.saturating_duration_since(first.at).as_secs_f64();
        (span > 0.0).then(|| (window.samples.len() - 1) as f64 / span)
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1e6
}

/// Snapshot of capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames handed to the frame handler.
    pub delivered: u64,
    /// Frames dequeued (or due) but not delivered.
    pub dropped: u64,
    /// Frames the hardware skipped, from gaps in the driver sequence.
    pub sequence_gaps: u64,
    pub source_changes: u64,
    /// Control-loop cycles that ended in an error.
    pub restarts: u64,
    pub handler_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    sequence_gaps: AtomicU64,
    source_changes: AtomicU64,
    restarts: AtomicU64,
    handler_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sequence_gap(&self, frames: u64) {
        self.sequence_gaps.fetch_add(frames, Ordering::Relaxed);
    }

    pub(crate) fn source_changed(&self) {
        self.source_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn restarted(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_failed(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            source_changes: self.source_changes.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_covers_the_window_only() {
        let metrics = StageMetrics::default();
        assert_eq!(metrics.avg_millis(), None);
        for ms in 1..=125 {
            metrics.record(Duration::from_millis(ms));
        }
        assert_eq!(metrics.total_samples(), 125);
        let avg = metrics.avg_millis().unwrap();
        assert!((avg - 65.5).abs() < 1e-6, "{avg}");
        assert_eq!(metrics.max_millis(), Some(125.0));
    }

    #[test]
    fn fps_from_sample_spacing() {
        let metrics = StageMetrics::default();
        let start = Instant::now();
        metrics.record_at(start, Duration::from_millis(1));
        assert_eq!(metrics.fps(), None);
        for frame in 1..=10 {
            metrics.record_at(start + Duration::from_millis(10 * frame), Duration::from_millis(1));
        }
        let fps = metrics.fps().unwrap();
        assert!((fps - 100.0).abs() < 1e-6, "{fps}");
    }

    #[test]
    fn counters_snapshot() {
        let counters = Counters::default();
        counters.delivered();
        counters.dropped();
        counters.sequence_gap(2);
        assert_eq!(
            counters.snapshot(),
            CaptureStats {
                delivered: 1,
                dropped: 1,
                sequence_gaps: 2,
                ..Default::default()
            }
        );
    }
}
