//! One-shot timed callbacks
//!
//! The core only ever needs "send this command to the downloader after a
//! delay" (server reactivation after a penalty). Every scheduled entry is a
//! sleeping task racing the engine's shutdown token; pending entries are
//! listed for [`crate::Engine::scheduled`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::downloader::Command;

/// A callback waiting for its time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// What will happen, e.g. `reactivate news.example.com`
    pub name: String,
    /// Time left before it fires
    #[serde(with = "crate::config::duration_serde")]
    pub due_in: Duration,
}

#[derive(Debug, Default)]
struct Pending {
    next_id: u64,
    entries: BTreeMap<u64, (String, Instant)>,
}

/// Timed delivery of downloader commands
#[derive(Debug, Clone)]
pub(crate) struct Scheduler {
    pending: Arc<Mutex<Pending>>,
    tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>, shutdown: CancellationToken) -> Self {
        Self {
            pending: Arc::default(),
            tx,
            shutdown,
        }
    }

    /// Send `command` to the downloader once `after` has elapsed
    ///
    /// Dropped silently when the engine shuts down first.
    pub(crate) fn schedule(&self, after: Duration, label: String, command: Command) {
        let due = Instant::now() + after;
        let id = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let id = pending.next_id;
            pending.next_id += 1;
            pending.entries.insert(id, (label.clone(), due));
            id
        };
        debug!(task = %label, after_secs = after.as_secs(), "scheduled");

        let pending = Arc::clone(&self.pending);
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let fire = tokio::select! {
                _ = shutdown.cancelled() => false,
                _ = tokio::time::sleep_until(due) => true,
            };
            pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .remove(&id);
            if fire {
                trace!(task = %label, "firing scheduled task");
                let _ = tx.send(command);
            }
        });
    }

    /// Entries not yet fired, soonest first
    pub(crate) fn pending(&self) -> Vec<ScheduledTask> {
        let now = Instant::now();
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tasks: Vec<(Instant, ScheduledTask)> = pending
            .entries
            .values()
            .map(|(name, due)| {
                (
                    *due,
                    ScheduledTask {
                        name: name.clone(),
                        due_in: due.saturating_duration_since(now),
                    },
                )
            })
            .collect();
        tasks.sort_by_key(|(due, _)| *due);
        tasks.into_iter().map(|(_, task)| task).collect()
    }
}
