//! NNTP server state: penalties, capability flags and article prefetch
//!
//! A [`Server`] is owned by the downloader loop. The queue and the job model
//! only see the lightweight [`ServerInfo`] view (id, priority, active), which
//! is all the try-list logic needs.
//!
//! Error handling follows a small state machine:
//!
//! * a transient error (timeout, dropped socket) increments `bad_cons`; an
//!   optional server whose `bad_cons` exceeds three per connection is
//!   disabled for the timeout penalty
//! * an account-level error (bad login, too many connections, payment)
//!   blocks the server at once for the penalty of its [`ErrorClass`]
//! * a required server is never disabled; its connections wait out the
//!   penalty instead
//!
//! Each block carries a stamp. When several connections fail in a burst the
//! earliest reactivation wins and later stamps are ignored when they fire.

mod penalty;
mod resolve;

pub use penalty::{ErrorClass, classify, classify_error};
pub(crate) use resolve::{AddrCache, happy_eyeballs};

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::queue::NzbQueue;
use crate::types::{ArticleRef, ServerId};

/// Articles fetched from the queue per prefetch
pub(crate) const ARTICLE_QUEUE_TARGET: usize = 20;

/// Pause before asking the queue again after an empty prefetch
const SEARCH_COOLDOWN: Duration = Duration::from_millis(500);

/// Transient errors per connection before an optional server is disabled
const BAD_CONS_PER_THREAD: usize = 3;

/// What the try-list logic needs to know about a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server id
    pub id: ServerId,
    /// Priority (0 is best)
    pub priority: u32,
    /// Whether the server currently accepts work
    pub active: bool,
}

impl ServerInfo {
    /// Build a view
    pub fn new(id: ServerId, priority: u32, active: bool) -> Self {
        Self {
            id,
            priority,
            active,
        }
    }
}

/// An outstanding block on a server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Penalty {
    /// When the server may be used again
    pub until: Instant,
    /// Identifies the scheduled reactivation
    pub stamp: u64,
    /// What caused the block
    pub class: ErrorClass,
}

/// What the downloader must do after a connection error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Only this connection waits before reconnecting
    Reconnect {
        /// Delay before the next connect attempt
        delay: Duration,
    },
    /// The server is blocked
    Disabled {
        /// Time until reactivation
        penalty: Duration,
        /// Stamp to pass to [`Server::reactivate`]
        stamp: u64,
        /// A new reactivation must be scheduled (false when an earlier one
        /// is already pending)
        schedule: bool,
    },
}

/// Result of asking a server for its next article
#[derive(Debug, Default)]
pub(crate) struct Prefetch {
    /// Article to dispatch now
    pub article: Option<ArticleRef>,
    /// Articles past the server's retention, to be marked tried on it
    pub expired: Vec<ArticleRef>,
}

/// Runtime state of one configured server
#[derive(Debug)]
pub struct Server {
    /// Server id (index into the configured server list)
    pub id: ServerId,
    /// Configuration
    pub config: ServerConfig,
    /// Accepting work
    pub active: bool,
    /// Transient errors since the last successful login
    pub bad_cons: u32,
    /// BODY is supported (otherwise ARTICLE is used)
    pub have_body: bool,
    /// STAT is supported (otherwise HEAD is used for pre-checks)
    pub have_stat: bool,
    pub(crate) addr: AddrCache,
    penalty: Option<Penalty>,
    article_queue: VecDeque<ArticleRef>,
    next_article_search: Option<Instant>,
    next_stamp: u64,
}

impl Server {
    /// Fresh state for a configured server
    pub fn new(id: ServerId, config: ServerConfig) -> Self {
        Self {
            id,
            active: config.enabled,
            config,
            bad_cons: 0,
            have_body: true,
            have_stat: true,
            addr: AddrCache::default(),
            penalty: None,
            article_queue: VecDeque::new(),
            next_article_search: None,
            next_stamp: 0,
        }
    }

    /// Name used in logs and events
    pub fn name(&self) -> &str {
        self.config.display_name()
    }

    /// Configured number of connections
    pub fn threads(&self) -> usize {
        self.config.connections
    }

    /// View for the queue
    pub fn info(&self) -> ServerInfo {
        ServerInfo::new(self.id, self.config.priority, self.active)
    }

    /// Block currently in effect
    pub fn penalty(&self) -> Option<&Penalty> {
        self.penalty.as_ref()
    }

    /// Apply the penalty rules to a connection error
    pub fn register_error(
        &mut self,
        class: ErrorClass,
        now: Instant,
        no_penalties: bool,
    ) -> ErrorAction {
        self.bad_cons += 1;
        let penalty = class.penalty(no_penalties);

        if self.config.required {
            let delay = if class.blocks_server() {
                penalty
            } else {
                self.config.timeout
            };
            debug!(server = %self.name(), ?class, ?delay, "required server error, connection waits");
            return ErrorAction::Reconnect { delay };
        }

        let too_many_errors = self.config.optional
            && self.bad_cons as usize > BAD_CONS_PER_THREAD * self.threads().max(1);
        if class.blocks_server() || too_many_errors {
            if too_many_errors {
                warn!(server = %self.name(), bad_cons = self.bad_cons, "too many connection errors");
            }
            self.bad_cons = 0;
            return self.disable(class, penalty, now);
        }
        ErrorAction::Reconnect {
            delay: self.config.timeout,
        }
    }

    fn disable(&mut self, class: ErrorClass, penalty: Duration, now: Instant) -> ErrorAction {
        self.active = false;
        let until = now + penalty;
        if let Some(existing) = self.penalty
            && existing.until <= until
        {
            return ErrorAction::Disabled {
                penalty: existing.until.saturating_duration_since(now),
                stamp: existing.stamp,
                schedule: false,
            };
        }
        self.next_stamp += 1;
        let stamp = self.next_stamp;
        self.penalty = Some(Penalty {
            until,
            stamp,
            class,
        });
        info!(server = %self.name(), ?class, penalty_secs = penalty.as_secs_f64(), "server blocked");
        ErrorAction::Disabled {
            penalty,
            stamp,
            schedule: true,
        }
    }

    /// Lift the block identified by `stamp`
    ///
    /// Returns `false` when the stamp was superseded or the server was
    /// already unblocked.
    pub fn reactivate(&mut self, stamp: u64) -> bool {
        match self.penalty {
            Some(p) if p.stamp == stamp => {
                self.unblock();
                true
            }
            _ => false,
        }
    }

    /// Lift any block (user action)
    pub fn unblock(&mut self) {
        self.penalty = None;
        self.bad_cons = 0;
        self.active = self.config.enabled;
        self.next_article_search = None;
        info!(server = %self.name(), "server reactivated");
    }

    /// A connection logged in successfully
    pub fn register_login(&mut self) {
        self.bad_cons = 0;
    }

    /// Next article to dispatch, prefetching from the queue when needed
    ///
    /// When an article's job was posted before the server's retention, it
    /// and every other prefetched article of the same job are returned as
    /// expired instead of being fetched. With `force_only` only `Force` jobs
    /// are asked for new articles.
    pub(crate) fn next_article(
        &mut self,
        queue: &mut NzbQueue,
        now: Instant,
        force_only: bool,
    ) -> Prefetch {
        let mut expired = Vec::new();
        if self.article_queue.is_empty() {
            if self.next_article_search.is_some_and(|at| now < at) {
                return Prefetch::default();
            }
            let batch = queue.get_articles_filtered(
                self.id,
                ARTICLE_QUEUE_TARGET,
                chrono::Utc::now(),
                force_only,
            );
            if batch.is_empty() {
                self.next_article_search = Some(now + SEARCH_COOLDOWN);
                return Prefetch::default();
            }
            self.next_article_search = None;
            self.article_queue.extend(batch);
        }

        let retention = self.config.retention;
        while let Some(article) = self.article_queue.pop_front() {
            if queue.job_older_than(article.job, retention) {
                let job = article.job;
                expired.push(article);
                self.article_queue.retain(|a| {
                    if a.job == job {
                        expired.push(*a);
                        false
                    } else {
                        true
                    }
                });
                debug!(server = %self.name(), job_id = %job, "articles beyond server retention");
                continue;
            }
            return Prefetch {
                article: Some(article),
                expired,
            };
        }
        Prefetch {
            article: None,
            expired,
        }
    }

    /// Put an article back at the head of the prefetch queue
    pub(crate) fn return_article(&mut self, article: ArticleRef) {
        self.article_queue.push_front(article);
    }

    /// Remove and return every prefetched article
    pub(crate) fn drain_articles(&mut self) -> Vec<ArticleRef> {
        self.article_queue.drain(..).collect()
    }

    /// Drop prefetched articles of a removed job
    pub(crate) fn forget_job(&mut self, job: crate::types::JobId) {
        self.article_queue.retain(|a| a.job != job);
    }

    /// Number of prefetched articles
    pub fn queued_articles(&self) -> usize {
        self.article_queue.len()
    }

    /// Allow an immediate prefetch (after the queue changed)
    pub(crate) fn wake(&mut self) {
        self.next_article_search = None;
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn server(required: bool, optional: bool) -> Server {
        let mut config = ServerConfig::new("news", "127.0.0.1", 119);
        config.connections = 2;
        config.required = required;
        config.optional = optional;
        Server::new(ServerId(0), config)
    }

    #[test]
    fn login_failure_blocks_for_ten_minutes() {
        let mut s = server(false, false);
        let now = Instant::now();
        let action = s.register_error(ErrorClass::BadLogin, now, false);
        assert_eq!(
            action,
            ErrorAction::Disabled {
                penalty: Duration::from_secs(600),
                stamp: 1,
                schedule: true
            }
        );
        assert!(!s.active);
        assert!(s.reactivate(1));
        assert!(s.active);
    }

    #[test]
    fn earliest_reactivation_wins() {
        let mut s = server(false, false);
        let now = Instant::now();
        s.register_error(ErrorClass::VeryShort, now, false);
        let second = s.register_error(ErrorClass::BadLogin, now, false);
        assert!(
            matches!(second, ErrorAction::Disabled { stamp: 1, schedule: false, .. }),
            "later block is ignored: {second:?}"
        );

        let mut s = server(false, false);
        s.register_error(ErrorClass::BadLogin, now, false);
        let shorter = s.register_error(ErrorClass::VeryShort, now, false);
        assert!(matches!(shorter, ErrorAction::Disabled { stamp: 2, schedule: true, .. }));
        assert!(!s.reactivate(1), "superseded stamp does nothing");
        assert!(s.reactivate(2));
    }

    #[test]
    fn transient_errors_disable_optional_servers_only() {
        let now = Instant::now();
        let mut optional = server(false, true);
        let mut regular = server(false, false);
        let mut last = None;
        for _ in 0..7 {
            last = Some(optional.register_error(ErrorClass::Transient, now, false));
            regular.register_error(ErrorClass::Transient, now, false);
        }
        assert!(matches!(last, Some(ErrorAction::Disabled { .. })), "7 errors over 2 threads");
        assert!(!optional.active);
        assert!(regular.active, "non-optional servers keep trying");
        assert_eq!(regular.bad_cons, 7);
    }

    #[test]
    fn required_server_is_never_disabled() {
        let mut s = server(true, true);
        let now = Instant::now();
        for _ in 0..20 {
            let action = s.register_error(ErrorClass::BadLogin, now, false);
            assert_eq!(
                action,
                ErrorAction::Reconnect {
                    delay: Duration::from_secs(600)
                }
            );
        }
        assert!(s.active);
        assert!(s.penalty().is_none());
    }
}
