use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Counts automatic restarts inside a sliding window.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    limit: u32,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            restarts: VecDeque::new(),
        }
    }

    /// Restarts recorded within the window ending now.
    pub fn count(&mut self) -> u32 {
        self.prune(Instant::now());
        self.restarts.len() as u32
    }

    /// Records a restart if the window still has room. Returns the restart's
    /// ordinal within the window, or `None` when the limit is reached.
    pub fn try_record(&mut self) -> Option<u32> {
        let now = Instant::now();
        self.prune(now);
        if self.restarts.len() as u32 >= self.limit {
            return None;
        }
        self.restarts.push_back(now);
        Some(self.restarts.len() as u32)
    }

    pub fn reset(&mut self) {
        self.restarts.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.restarts.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }
}
