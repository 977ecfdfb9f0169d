use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::routes::user_fingerprint;

/// Fixed-window request quota per caller and endpoint group.
#[derive(Clone)]
pub struct EndpointRateLimiter {
    windows: Arc<Mutex<WindowTable>>,
    window: Duration,
    sync_limit: u32,
    media_limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectedEndpoint {
    Sync,
    MediaPresign,
}

#[derive(Default)]
struct RateLimitMetrics {
    sync_allowed: AtomicU64,
    sync_limited: AtomicU64,
    media_allowed: AtomicU64,
    media_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub sync_allowed: u64,
    pub sync_limited: u64,
    pub media_allowed: u64,
    pub media_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

/// Open windows keyed by endpoint group and subject. Windows that ran out
/// are swept at most once per window length.
struct WindowTable {
    entries: HashMap<(ProtectedEndpoint, String), RateWindow>,
    last_sweep: Instant,
}

impl WindowTable {
    fn sweep(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.last_sweep) < window {
            return;
        }
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.started_at) < window);
        self.last_sweep = now;
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.entries.len(), "Swept rate windows");
        }
    }
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.rate_limit_window,
            config.sync_rate_limit_per_window,
            config.media_presign_rate_limit_per_window,
        )
    }

    fn new(window: Duration, sync_limit: u32, media_limit: u32) -> Self {
        Self {
            windows: Arc::new(Mutex::new(WindowTable {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            })),
            window,
            sync_limit,
            media_limit,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    const fn limit_for(&self, endpoint: ProtectedEndpoint) -> u32 {
        match endpoint {
            ProtectedEndpoint::Sync => self.sync_limit,
            ProtectedEndpoint::MediaPresign => self.media_limit,
        }
    }

    /// Count one request of `subject` against `endpoint`, or reject it with
    /// the seconds left in the current window.
    pub async fn check(&self, endpoint: ProtectedEndpoint, subject: &str) -> Result<(), AppError> {
        let limit = self.limit_for(endpoint);
        let now = Instant::now();
        let mut table = self.windows.lock().await;
        table.sweep(now, self.window);

        let entry = table
            .entries
            .entry((endpoint, subject.to_string()))
            .or_insert(RateWindow {
                started_at: now,
                count: 0,
            });
        if now.duration_since(entry.started_at) >= self.window {
            *entry = RateWindow {
                started_at: now,
                count: 0,
            };
        }

        if entry.count >= limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs()
                .max(1);
            drop(table);
            self.mark(endpoint, false);
            tracing::warn!(
                endpoint = endpoint.label(),
                user = user_fingerprint(subject),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                "Rate limit exceeded for protected endpoint",
                retry_after_secs,
            ));
        }

        entry.count += 1;
        drop(table);
        self.mark(endpoint, true);
        Ok(())
    }

    #[cfg(test)]
    async fn tracked_windows(&self) -> usize {
        self.windows.lock().await.entries.len()
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            sync_allowed: self.metrics.sync_allowed.load(Ordering::Relaxed),
            sync_limited: self.metrics.sync_limited.load(Ordering::Relaxed),
            media_allowed: self.metrics.media_allowed.load(Ordering::Relaxed),
            media_limited: self.metrics.media_limited.load(Ordering::Relaxed),
        }
    }

    fn mark(&self, endpoint: ProtectedEndpoint, allowed: bool) {
        let counter = match (endpoint, allowed) {
            (ProtectedEndpoint::Sync, true) => &self.metrics.sync_allowed,
            (ProtectedEndpoint::Sync, false) => &self.metrics.sync_limited,
            (ProtectedEndpoint::MediaPresign, true) => &self.metrics.media_allowed,
            (ProtectedEndpoint::MediaPresign, false) => &self.metrics.media_limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::MediaPresign => "media_presign",
        }
    }
}
