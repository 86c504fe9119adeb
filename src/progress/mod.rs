//! Upload progress tracking
//!
//! [`ProgressTracker`] accumulates transferred bytes for one upload attempt and
//! renders a single-line progress bar. [`ProgressStream`] feeds it from any
//! byte stream as the transport consumes data.
//!
//! # Example
//!
//! ```
//! use presign_uploadr::progress::ProgressTracker;
//!
//! let tracker = ProgressTracker::new(1000, false);
//! tracker.update(250);
//! let snapshot = tracker.update(250);
//! assert_eq!(snapshot.percent, 50);
//! ```

mod stream;

pub use stream::ProgressStream;

use parking_lot::Mutex;
use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Width of the rendered bar in characters
const BAR_WIDTH: usize = 30;

/// Mutable state of one upload attempt, guarded by the tracker's lock.
#[derive(Debug)]
pub struct ProgressState {
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub last_reported_percent: Option<u32>,
    pub start_time: Instant,
}

/// Point-in-time view of an upload's progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub percent: u32,
    /// Bytes per second since the tracker was created
    pub throughput: f64,
    /// `None` while throughput is zero or the estimate does not fit a `Duration`
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    fn compute(state: &ProgressState, elapsed: Duration) -> Self {
        let percent = percent_of(state.transferred_bytes, state.total_bytes);
        let elapsed_secs = elapsed.as_secs_f64();
        let throughput = if elapsed_secs > 0.0 {
            state.transferred_bytes as f64 / elapsed_secs
        } else {
            0.0
        };
        let remaining = state.total_bytes - state.transferred_bytes;
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if throughput > 0.0 {
            // Out of range for a Duration means unknown, not a panic.
            Duration::try_from_secs_f64(remaining as f64 / throughput).ok()
        } else {
            None
        };

        Self {
            transferred_bytes: state.transferred_bytes,
            total_bytes: state.total_bytes,
            percent,
            throughput,
            eta,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.transferred_bytes == self.total_bytes
    }
}

/// `floor(transferred * 100 / total)`; an empty upload is complete.
fn percent_of(transferred: u64, total: u64) -> u32 {
    if total == 0 {
        return 100;
    }
    ((transferred as u128 * 100) / total as u128) as u32
}

struct Inner {
    state: ProgressState,
    output: Box<dyn Write + Send>,
    finished: bool,
}

/// Thread-safe byte counter for a single upload attempt
///
/// `update` may be called from whichever thread polls the request body.
/// The running total never decreases and is clamped to `total_bytes`, so a
/// resumed range that re-sends bytes cannot push progress past 100%.
pub struct ProgressTracker {
    show_progress: bool,
    inner: Mutex<Inner>,
}

impl ProgressTracker {
    /// Create a tracker that renders to stderr when `show_progress` is set
    pub fn new(total_bytes: u64, show_progress: bool) -> Self {
        Self::with_writer(total_bytes, show_progress, io::stderr())
    }

    /// Create a tracker that renders into `output`
    pub fn with_writer<W>(total_bytes: u64, show_progress: bool, output: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            show_progress,
            inner: Mutex::new(Inner {
                state: ProgressState {
                    total_bytes,
                    transferred_bytes: 0,
                    last_reported_percent: None,
                    start_time: Instant::now(),
                },
                output: Box::new(output),
                finished: total_bytes == 0,
            }),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().state.total_bytes
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.inner.lock().state.transferred_bytes
    }

    /// Current progress without recording any bytes
    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.lock();
        ProgressSnapshot::compute(&inner.state, inner.state.start_time.elapsed())
    }

    /// Record `bytes` as transferred and redraw the bar if the percentage moved
    pub fn update(&self, bytes: u64) -> ProgressSnapshot {
        let mut inner = self.inner.lock();
        let state = &mut inner.state;
        state.transferred_bytes = state
            .transferred_bytes
            .saturating_add(bytes)
            .min(state.total_bytes);

        let snapshot = ProgressSnapshot::compute(state, state.start_time.elapsed());

        // Empty uploads are complete from the start and never draw a bar.
        if state.total_bytes == 0 {
            return snapshot;
        }

        if state.last_reported_percent == Some(snapshot.percent) {
            return snapshot;
        }
        state.last_reported_percent = Some(snapshot.percent);

        if self.show_progress {
            let line = render_bar(&snapshot);
            let finish = snapshot.is_complete() && !inner.finished;
            // Progress output is cosmetic; a closed terminal must not fail the upload.
            let _ = write!(inner.output, "\r{}", line);
            if finish {
                let _ = writeln!(inner.output);
            }
            let _ = inner.output.flush();
        }
        if snapshot.is_complete() {
            inner.finished = true;
        }

        snapshot
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ProgressTracker")
            .field("show_progress", &self.show_progress)
            .field("state", &inner.state)
            .finish()
    }
}

/// Render `[#####-----]  50% 125.0 MiB/250.0 MiB 10.0 MiB/s ETA 00:00:12`
pub fn render_bar(snapshot: &ProgressSnapshot) -> String {
    let filled = (snapshot.percent.min(100) as usize * BAR_WIDTH) / 100;
    let eta = match snapshot.eta {
        Some(eta) => format_duration(eta),
        None => "--:--:--".to_string(),
    };

    format!(
        "[{}{}] {:>3}% {}/{} {}/s ETA {}",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled),
        snapshot.percent,
        format_bytes(snapshot.transferred_bytes as f64),
        format_bytes(snapshot.total_bytes as f64),
        format_bytes(snapshot.throughput),
        eta
    )
}

fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value as u64, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Writer that keeps everything it receives
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    #[test]
    fn test_percent_reaches_100_and_never_decreases() {
        let tracker = ProgressTracker::new(1000, false);
        let mut last = 0;
        for step in [1, 9, 90, 150, 250, 500] {
            let snapshot = tracker.update(step);
            assert!(snapshot.percent >= last);
            last = snapshot.percent;
        }
        assert_eq!(last, 100);
        assert_eq!(tracker.transferred_bytes(), 1000);
    }

    #[test]
    fn test_percent_is_floored() {
        let tracker = ProgressTracker::new(3, false);
        assert_eq!(tracker.update(1).percent, 33);
        assert_eq!(tracker.update(1).percent, 66);
    }

    #[test]
    fn test_zero_total_is_complete_without_output() {
        let buf = SharedBuf::default();
        let tracker = ProgressTracker::with_writer(0, true, buf.clone());

        let snapshot = tracker.update(0);
        assert_eq!(snapshot.percent, 100);
        assert_eq!(snapshot.eta, Some(Duration::ZERO));
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn test_transferred_is_clamped_to_total() {
        let tracker = ProgressTracker::new(100, false);
        tracker.update(80);
        let snapshot = tracker.update(80);
        assert_eq!(snapshot.transferred_bytes, 100);
        assert_eq!(snapshot.percent, 100);
    }

    #[test]
    fn test_renders_only_on_percent_change() {
        let buf = SharedBuf::default();
        let tracker = ProgressTracker::with_writer(1000, true, buf.clone());

        tracker.update(1);
        tracker.update(1);
        tracker.update(1);
        // All three updates stay at 0%.
        assert_eq!(buf.contents().matches('\r').count(), 1);

        tracker.update(10);
        assert_eq!(buf.contents().matches('\r').count(), 2);
    }

    #[test]
    fn test_final_newline_emitted_once() {
        let buf = SharedBuf::default();
        let tracker = ProgressTracker::with_writer(10, true, buf.clone());

        tracker.update(10);
        tracker.update(5);

        let output = buf.contents();
        assert!(output.ends_with('\n'));
        assert_eq!(output.matches('\n').count(), 1);
        assert!(output.contains("100%"));
    }

    #[test]
    fn test_hidden_progress_writes_nothing() {
        let buf = SharedBuf::default();
        let tracker = ProgressTracker::with_writer(10, false, buf.clone());
        tracker.update(10);
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn test_unknown_eta_when_nothing_transferred() {
        let tracker = ProgressTracker::new(10, false);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.throughput, 0.0);
        assert_eq!(snapshot.eta, None);
        assert!(render_bar(&snapshot).ends_with("ETA --:--:--"));
    }

    #[test]
    fn test_eta_unknown_when_too_large() {
        let state = ProgressState {
            total_bytes: u64::MAX,
            transferred_bytes: 1,
            last_reported_percent: None,
            start_time: Instant::now(),
        };
        let snapshot = ProgressSnapshot::compute(&state, Duration::from_secs(1_000_000));
        assert!(snapshot.throughput > 0.0);
        assert_eq!(snapshot.eta, None);
        assert!(render_bar(&snapshot).ends_with("ETA --:--:--"));
    }

    #[test]
    fn test_concurrent_updates_keep_total() {
        let tracker = Arc::new(ProgressTracker::new(8000, false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        tracker.update(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.transferred_bytes(), 8000);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512.0), "512 B");
        assert_eq!(format_bytes(1536.0), "1.5 KiB");
        assert_eq!(format_bytes(250.0 * 1024.0 * 1024.0), "250.0 MiB");
    }
}
