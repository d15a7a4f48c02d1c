//! Receive-rate accounting and bandwidth limiting
//!
//! [`BpsMeter`] is shared by every connection task. It keeps:
//!
//! - a rolling window of received byte counts, for the current rate
//! - per-server byte and article counters ([`ServerStats`])
//! - a token bucket that connection tasks drain before reading more data
//!
//! The token bucket is lock-free; the window sits behind a short mutex that
//! is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::types::ServerId;

/// Length of the rolling rate window
const WINDOW: Duration = Duration::from_secs(10);

/// Longest single wait for tokens, so limit changes apply quickly
const MAX_THROTTLE_SLEEP: Duration = Duration::from_millis(100);

/// Shortest wait for tokens
const MIN_THROTTLE_SLEEP: Duration = Duration::from_millis(10);

/// Counters for one server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    /// Bytes received since start
    pub bytes: u64,
    /// Articles the server delivered
    pub articles_ok: u64,
    /// Articles the server did not have
    pub articles_failed: u64,
}

impl ServerStats {
    /// Share of requested articles the server delivered, in percent
    pub fn availability(&self) -> f64 {
        let total = self.articles_ok + self.articles_failed;
        if total == 0 {
            return 100.0;
        }
        self.articles_ok as f64 * 100.0 / total as f64
    }
}

#[derive(Debug, Default)]
struct Window {
    samples: VecDeque<(Instant, u64)>,
    in_window: u64,
    total: u64,
    servers: HashMap<ServerId, ServerStats>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(at) <= WINDOW {
                break;
            }
            self.samples.pop_front();
            self.in_window -= bytes;
        }
    }
}

#[derive(Debug)]
struct Inner {
    limit_bps: AtomicU64,
    tokens: AtomicU64,
    last_refill: AtomicU64,
    window: Mutex<Window>,
}

/// Process-wide byte-rate accountant
#[derive(Debug, Clone)]
pub struct BpsMeter {
    inner: Arc<Inner>,
}

impl BpsMeter {
    /// Meter with a bandwidth limit in bytes per second (0 = unlimited)
    #[must_use]
    pub fn new(limit_bps: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit_bps: AtomicU64::new(limit_bps),
                tokens: AtomicU64::new(limit_bps),
                last_refill: AtomicU64::new(now_nanos()),
                window: Mutex::new(Window::default()),
            }),
        }
    }

    fn window(&self) -> MutexGuard<'_, Window> {
        self.inner
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Count bytes received from `server`
    pub fn record(&self, server: ServerId, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let now = Instant::now();
        let mut window = self.window();
        window.samples.push_back((now, bytes));
        window.in_window += bytes;
        window.total += bytes;
        window.servers.entry(server).or_default().bytes += bytes;
        window.prune(now);
    }

    /// Count an article outcome for `server`
    pub fn record_article(&self, server: ServerId, success: bool) {
        let mut window = self.window();
        let stats = window.servers.entry(server).or_default();
        if success {
            stats.articles_ok += 1;
        } else {
            stats.articles_failed += 1;
        }
    }

    /// Drop samples older than the window
    pub fn update(&self) {
        self.window().prune(Instant::now());
    }

    /// Forget the window (the downloader went idle)
    pub fn reset(&self) {
        let mut window = self.window();
        window.samples.clear();
        window.in_window = 0;
    }

    /// Average receive rate over the window in bytes per second
    pub fn rate(&self) -> u64 {
        let now = Instant::now();
        let mut window = self.window();
        window.prune(now);
        let Some(&(oldest, _)) = window.samples.front() else {
            return 0;
        };
        let span = now.saturating_duration_since(oldest).max(Duration::from_secs(1));
        (window.in_window as f64 / span.as_secs_f64()) as u64
    }

    /// Bytes received since start
    pub fn total_bytes(&self) -> u64 {
        self.window().total
    }

    /// Counters of one server
    pub fn server_stats(&self, server: ServerId) -> ServerStats {
        self.window()
            .servers
            .get(&server)
            .copied()
            .unwrap_or_default()
    }

    /// Counters of every server that received traffic
    pub fn all_server_stats(&self) -> HashMap<ServerId, ServerStats> {
        self.window().servers.clone()
    }

    /// Change the bandwidth limit (0 = unlimited)
    ///
    /// Raising the limit tops the bucket up by the difference; lowering it
    /// keeps the tokens already granted.
    pub fn set_limit(&self, limit_bps: u64) {
        let old = self.inner.limit_bps.swap(limit_bps, Ordering::SeqCst);
        if limit_bps > old {
            self.inner
                .tokens
                .fetch_add(limit_bps - old, Ordering::SeqCst);
        }
    }

    /// Current limit in bytes per second (0 = unlimited)
    pub fn limit(&self) -> u64 {
        self.inner.limit_bps.load(Ordering::Relaxed)
    }

    /// Wait until `bytes` may be read under the current limit
    pub async fn throttle(&self, bytes: u64) {
        let mut remaining = bytes;
        while remaining > 0 {
            let limit = self.inner.limit_bps.load(Ordering::Relaxed);
            if limit == 0 {
                return;
            }
            self.refill(limit);

            let available = self.inner.tokens.load(Ordering::SeqCst);
            let take = remaining.min(available);
            if take > 0 {
                if self
                    .inner
                    .tokens
                    .compare_exchange(available, available - take, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    remaining -= take;
                }
                continue;
            }

            let wait = Duration::from_secs_f64(remaining as f64 / limit as f64);
            tokio::time::sleep(wait.clamp(MIN_THROTTLE_SLEEP, MAX_THROTTLE_SLEEP)).await;
        }
    }

    fn refill(&self, limit: u64) {
        let now = now_nanos();
        let last = self.inner.last_refill.load(Ordering::SeqCst);
        let elapsed = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let add = (limit as f64 * elapsed) as u64;
        if add > 0
            && self
                .inner
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let current = self.inner.tokens.load(Ordering::SeqCst);
            self.inner
                .tokens
                .store((current + add).min(limit), Ordering::SeqCst);
        }
    }
}

impl Default for BpsMeter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Monotonic nanoseconds since the first call
fn now_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
