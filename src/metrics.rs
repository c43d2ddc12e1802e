//! Metric gauges with short windowed history.
//!
//! The pool publishes its queue length and handle counts here, and reads
//! the recent maxima back when deciding how many handles the workload
//! actually needs.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::trace;

/// How much history a gauge retains. Old samples beyond this horizon are
/// useless to the autosizer and are dropped on every update.
const HISTORY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
struct GaugeInner {
    value: u64,
    /// `(recorded_at, value)` samples, oldest first.
    history: VecDeque<(Instant, u64)>,
}

/// A named numeric gauge that remembers where it has been.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    inner: Mutex<GaugeInner>,
}

impl Gauge {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(GaugeInner {
                value: 0,
                history: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Record a new value.
    pub fn set(&self, value: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.value = value;
        inner.history.push_back((now, value));
        while let Some(&(at, _)) = inner.history.front() {
            if now.duration_since(at) <= HISTORY {
                break;
            }
            inner.history.pop_front();
        }
        trace!(gauge = self.name, value);
    }

    /// The most recently recorded value.
    pub fn get(&self) -> u64 {
        self.inner.lock().unwrap().value
    }

    /// The largest value recorded at or after `since`. The current value
    /// counts as well, so a gauge that has been flat still reports it.
    pub fn maximum_since(&self, since: Instant) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .history
            .iter()
            .filter(|(at, _)| *at >= since)
            .map(|&(_, v)| v)
            .max()
            .unwrap_or(inner.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_maximum_over_window() {
        let gauge = Gauge::new("busy-handles");
        let start = Instant::now();

        gauge.set(2);
        tokio::time::advance(Duration::from_secs(5)).await;
        gauge.set(7);
        tokio::time::advance(Duration::from_secs(5)).await;
        gauge.set(3);

        assert_eq!(gauge.get(), 3);
        assert_eq!(gauge.maximum_since(start), 7);
        // a window starting after the peak no longer sees it
        assert_eq!(gauge.maximum_since(start + Duration::from_secs(6)), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flat_gauge_reports_current() {
        let gauge = Gauge::new("total-handles");
        gauge.set(4);
        tokio::time::advance(Duration::from_secs(60)).await;
        // no samples in the window, fall back to the live value
        assert_eq!(gauge.maximum_since(Instant::now()), 4);
    }
}
