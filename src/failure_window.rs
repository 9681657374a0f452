//! A counter for failures observed within a trailing time window.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Counts events within a sliding window; entries older than the window
/// are pruned on access.
///
/// Per-host failure rates are low frequency (a failed query, a failed
/// probe), so a mutex over a deque of timestamps is plenty.
#[derive(Debug)]
pub(crate) struct FailureWindow {
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl FailureWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn record(&self) {
        let mut events = self.events.lock().unwrap();
        prune(&mut events, self.window);
        events.push_back(Instant::now());
    }

    pub(crate) fn count(&self) -> usize {
        let mut events = self.events.lock().unwrap();
        prune(&mut events, self.window);
        events.len()
    }
}

fn prune(events: &mut VecDeque<Instant>, window: Duration) {
    let now = Instant::now();
    while let Some(oldest) = events.front() {
        if now.duration_since(*oldest) > window {
            events.pop_front();
        } else {
            break;
        }
    }
}
