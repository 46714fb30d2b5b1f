use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Once this many callers are tracked, idle ones are dropped on the next check.
const SWEEP_THRESHOLD: usize = 4096;

/// Sliding-window limiter keyed by client IP.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    limit: usize,
    hits: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new_per_minute(limit: usize) -> Self {
        Self::with_window(limit, Duration::from_secs(60))
    }

    pub fn with_window(limit: usize, window: Duration) -> Self {
        Self {
            window,
            limit,
            hits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Records a hit for `key`, or returns how long until the oldest one leaves the window.
    pub async fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;

        if hits.len() >= SWEEP_THRESHOLD {
            let window = self.window;
            hits.retain(|_, times| times.back().is_some_and(|t| now.duration_since(*t) < window));
        }

        let times = hits.entry(key.to_string()).or_default();
        while times.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            times.pop_front();
        }

        if times.len() < self.limit {
            times.push_back(now);
            return Ok(());
        }
        let wait = times
            .front()
            .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(self.window);
        Err(wait)
    }

    pub async fn allow(&self, key: &str) -> bool {
        self.check(key).await.is_ok()
    }
}
