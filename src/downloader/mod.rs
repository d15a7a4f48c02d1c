//! The downloader loop
//!
//! One task owns every server, every connection slot and every article
//! hand-out decision. Socket I/O runs in per-connection worker tasks
//! ([`crate::nntp`]); they report back over a channel and the loop applies
//! the outcome under the queue lock.
//!
//! The loop wakes on:
//! - a [`Command`] (pause, resume, server reactivation, job removal)
//! - a worker event (connected, article result, failure)
//! - a queue change notification
//! - a 500 ms tick that refreshes the meter and reaps dead workers
//!
//! After each wake-up it runs one dispatch pass: every idle slot of every
//! active server, best priority first, gets the server's next prefetched
//! article.

mod dispatch;
mod events;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use rustls::ClientConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::decoder::DecodeRequest;
use crate::engine::Context;
use crate::nntp::{self, Command as NntpCommand};
use crate::nntp::worker::{WorkerCommand, WorkerEvent, WorkerHandle};
use crate::server::{Server, ServerInfo};
use crate::types::{ArticleRef, JobId, ServerId};

/// Interval of the housekeeping tick
const CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Instructions for the downloader loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// Stop handing out articles (except for `Force` jobs)
    Pause,
    /// Hand out articles again
    Resume,
    /// A timed server block ran out
    ReactivateServer {
        /// Blocked server
        server: ServerId,
        /// Stamp of the block being lifted
        stamp: u64,
    },
    /// The user lifted a server block
    UnblockServer(ServerId),
    /// A job left the queue; drop its prefetched articles
    ForgetJob(JobId),
    /// Log out every idle connection
    Disconnect,
}

/// One connection slot of a server
#[derive(Debug, Default)]
struct Slot {
    /// Worker task, when connected or connecting
    worker: Option<WorkerHandle>,
    /// Article in flight and the command used for it
    busy: Option<(ArticleRef, NntpCommand)>,
    /// Do not connect before this instant
    reconnect_at: Option<Instant>,
}

impl Slot {
    fn quit(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.commands.send(WorkerCommand::Quit);
        }
    }
}

/// A server and its connection slots
#[derive(Debug)]
struct ServerState {
    server: Server,
    slots: Vec<Slot>,
    tls: Option<Arc<ClientConfig>>,
}

impl ServerState {
    fn busy(&self) -> usize {
        self.slots.iter().filter(|s| s.busy.is_some()).count()
    }
}

/// Servers that take part in downloading, as the queue sees them
///
/// A server configured with zero connections gets no state at all.
pub(crate) fn server_views(config: &Config) -> Vec<ServerInfo> {
    config
        .servers
        .iter()
        .enumerate()
        .filter(|(_, s)| s.connections > 0)
        .map(|(i, s)| ServerInfo::new(ServerId(i as u16), s.priority, s.enabled))
        .collect()
}

/// The selector loop state
pub(crate) struct Downloader {
    ctx: Arc<Context>,
    servers: Vec<ServerState>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    paused: bool,
}

impl Downloader {
    /// Build server states from the configuration
    pub(crate) fn new(ctx: Arc<Context>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let mut servers: Vec<ServerState> = ctx
            .config
            .servers
            .iter()
            .enumerate()
            .filter(|(_, config)| config.connections > 0)
            .map(|(i, config)| ServerState {
                server: Server::new(ServerId(i as u16), config.clone()),
                slots: (0..config.connections).map(|_| Slot::default()).collect(),
                tls: config.ssl.then(|| nntp::build_tls_config(config.ssl_verify)),
            })
            .collect();
        servers.sort_by_key(|s| (s.server.config.priority, s.server.id));
        let (events_tx, events) = mpsc::unbounded_channel();
        let paused = ctx.paused.load(Ordering::SeqCst);
        Self {
            ctx,
            servers,
            commands,
            events_tx,
            events,
            paused,
        }
    }

    fn state_mut(&mut self, id: ServerId) -> Option<&mut ServerState> {
        self.servers.iter_mut().find(|s| s.server.id == id)
    }

    /// Run until shutdown
    pub(crate) async fn run(mut self) {
        info!(servers = self.servers.len(), "downloader started");
        let mut tick = tokio::time::interval(CHECK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.dispatch().await;
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = self.ctx.queue_changed.notified() => {
                    for state in &mut self.servers {
                        state.server.wake();
                    }
                }
                _ = tick.tick() => {
                    self.ctx.bps.update();
                    self.reap_workers().await;
                }
            }
        }

        // hard reset without QUIT; workers watch the same token
        let busy: usize = self.servers.iter().map(ServerState::busy).sum();
        for state in &mut self.servers {
            for slot in &mut state.slots {
                slot.worker = None;
                slot.busy = None;
            }
            state.server.addr.clear();
        }
        self.ctx.bps.update();
        info!(busy, "downloader stopped");
    }

    /// Forward an article result to the decoder
    async fn decode(&self, request: DecodeRequest) {
        if self.ctx.decoder_tx.send(request).await.is_err() {
            debug!("decoder channel closed");
        }
    }
}

/// Start the loop
pub(crate) fn spawn(ctx: Arc<Context>, commands: mpsc::UnboundedReceiver<Command>) -> JoinHandle<()> {
    tokio::spawn(Downloader::new(ctx, commands).run())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
