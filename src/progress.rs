//! Monotonic, rate-limited stage progress emission.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Receives progress emissions. Implementations forward to job-run event
/// rows, log lines, or an external channel.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, pct: u8, message: &str);
}

/// Log-line sink used when no external channel is wired up.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, pct: u8, message: &str) {
        tracing::info!(pct, message, "stage progress");
    }
}

struct ReporterState {
    /// Highest percentage seen; emissions never go below it.
    highest_pct: u8,
    /// Last emitted (pct, message), for change gating.
    last_emitted: Option<(u8, String)>,
    last_emit_at: Option<Instant>,
}

/// Rate-limited progress reporter.
///
/// Percentages are clamped to 0..99 (100 is the caller's completion signal,
/// emitted elsewhere) and never decrease. An update is emitted only when
/// (pct, message) changed AND the minimum interval has elapsed; the first
/// update is never suppressed.
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    min_interval: Duration,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self::with_min_interval(sink, Duration::from_secs(2))
    }

    pub fn with_min_interval(sink: Arc<dyn ProgressSink>, min_interval: Duration) -> Self {
        Self {
            sink,
            min_interval,
            state: Mutex::new(ReporterState {
                highest_pct: 0,
                last_emitted: None,
                last_emit_at: None,
            }),
        }
    }

    /// Report absolute progress.
    pub fn update(&self, pct: u8, message: &str) {
        let mut state = self.state.lock().expect("progress state lock");
        let clamped = pct.min(99).max(state.highest_pct);
        state.highest_pct = clamped;

        let changed = state
            .last_emitted
            .as_ref()
            .map(|(last_pct, last_message)| *last_pct != clamped || last_message != message)
            .unwrap_or(true);
        if !changed {
            return;
        }
        let interval_ok = state
            .last_emit_at
            .map(|at| at.elapsed() >= self.min_interval)
            .unwrap_or(true);
        if !interval_ok {
            return;
        }

        state.last_emitted = Some((clamped, message.to_owned()));
        state.last_emit_at = Some(Instant::now());
        drop(state);
        self.sink.emit(clamped, message);
    }

    /// Report progress of `done` out of `total`, mapped linearly into
    /// [start, end]. A zero total reports `start`.
    pub fn update_range(&self, done: usize, total: usize, start: u8, end: u8, message: &str) {
        let start = start.min(99);
        let end = end.min(99).max(start);
        let pct = if total == 0 {
            start
        } else {
            let span = (end - start) as f64;
            let fraction = (done.min(total) as f64) / total as f64;
            start + (span * fraction).round() as u8
        };
        self.update(pct, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        emissions: Mutex<Vec<(u8, String)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self { emissions: Mutex::new(Vec::new()) })
        }

        fn emitted(&self) -> Vec<(u8, String)> {
            self.emissions.lock().unwrap().clone()
        }
    }

    impl ProgressSink for Recorder {
        fn emit(&self, pct: u8, message: &str) {
            self.emissions.lock().unwrap().push((pct, message.to_owned()));
        }
    }

    fn reporter(sink: Arc<Recorder>) -> ProgressReporter {
        ProgressReporter::with_min_interval(sink, Duration::ZERO)
    }

    #[test]
    fn first_update_always_emits() {
        let sink = Recorder::new();
        let progress = ProgressReporter::with_min_interval(sink.clone(), Duration::from_secs(60));
        progress.update(10, "canonicalizing");
        assert_eq!(sink.emitted(), vec![(10, "canonicalizing".to_owned())]);
    }

    #[test]
    fn percentage_never_decreases() {
        let sink = Recorder::new();
        let progress = reporter(sink.clone());
        progress.update(40, "building docs");
        progress.update(20, "building docs");
        let emitted = sink.emitted();
        assert_eq!(emitted.len(), 1, "a lower pct with the same message is unchanged");
        assert_eq!(emitted[0].0, 40);

        progress.update(20, "still building");
        // The message changed but pct stays pinned at the high-water mark.
        assert_eq!(sink.emitted()[1], (40, "still building".to_owned()));
    }

    #[test]
    fn pct_is_clamped_below_one_hundred() {
        let sink = Recorder::new();
        let progress = reporter(sink.clone());
        progress.update(250, "almost done");
        assert_eq!(sink.emitted()[0].0, 99);
    }

    #[test]
    fn unchanged_updates_are_suppressed() {
        let sink = Recorder::new();
        let progress = reporter(sink.clone());
        progress.update(10, "working");
        progress.update(10, "working");
        progress.update(10, "working");
        assert_eq!(sink.emitted().len(), 1);
    }

    #[test]
    fn interval_gates_subsequent_emissions() {
        let sink = Recorder::new();
        let progress = ProgressReporter::with_min_interval(sink.clone(), Duration::from_secs(60));
        progress.update(10, "working");
        progress.update(20, "working"); // changed, but inside the interval
        assert_eq!(sink.emitted().len(), 1);
    }

    #[test]
    fn range_maps_linearly() {
        let sink = Recorder::new();
        let progress = reporter(sink.clone());
        progress.update_range(0, 4, 20, 60, "nodes");
        progress.update_range(2, 4, 20, 60, "nodes");
        progress.update_range(4, 4, 20, 60, "nodes");
        let pcts: Vec<u8> = sink.emitted().iter().map(|(p, _)| *p).collect();
        assert_eq!(pcts, vec![20, 40, 60]);
    }

    #[test]
    fn zero_total_reports_start() {
        let sink = Recorder::new();
        let progress = reporter(sink.clone());
        progress.update_range(0, 0, 30, 70, "empty");
        assert_eq!(sink.emitted()[0].0, 30);
    }
}
