//! Worker reports and loop commands

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{Command, Downloader};
use crate::decoder::DecodeRequest;
use crate::error::NntpError;
use crate::job::ArticleOutcome;
use crate::nntp::worker::WorkerEvent;
use crate::nntp::{Command as NntpCommand, FetchReply};
use crate::server::{ErrorAction, classify_error};
use crate::types::{ArticleRef, Event, ServerId};

impl Downloader {
    pub(super) async fn handle_command(&mut self, command: Command) {
        debug!(?command, "downloader command");
        match command {
            Command::Pause => {
                if !self.paused {
                    self.paused = true;
                    self.ctx.paused.store(true, Ordering::SeqCst);
                    info!("downloader paused");
                    self.ctx.emit(Event::QueuePaused);
                }
            }
            Command::Resume => {
                self.ctx.retry_assembly();
                if self.paused {
                    self.paused = false;
                    self.ctx.paused.store(false, Ordering::SeqCst);
                    // servers parked on the queue try-list while only force jobs ran
                    self.ctx.queue.lock().await.reset_try_list();
                    for state in &mut self.servers {
                        state.server.wake();
                    }
                    info!("downloader resumed");
                    self.ctx.emit(Event::QueueResumed);
                }
            }
            Command::ReactivateServer { server, stamp } => {
                let Some(state) = self.state_mut(server) else {
                    return;
                };
                if state.server.reactivate(stamp) {
                    let name = state.server.name().to_string();
                    self.ctx.queue.lock().await.set_server_active(server, true);
                    self.ctx.emit(Event::ServerReactivated { server: name });
                } else {
                    debug!(%server, stamp, "stale reactivation ignored");
                }
            }
            Command::UnblockServer(server) => {
                let Some(state) = self.state_mut(server) else {
                    return;
                };
                state.server.unblock();
                for slot in &mut state.slots {
                    slot.reconnect_at = None;
                }
                let name = state.server.name().to_string();
                let active = state.server.active;
                self.ctx.queue.lock().await.set_server_active(server, active);
                self.ctx.emit(Event::ServerReactivated { server: name });
            }
            Command::ForgetJob(job) => {
                for state in &mut self.servers {
                    state.server.forget_job(job);
                }
            }
            Command::Disconnect => {
                let mut released = Vec::new();
                for state in &mut self.servers {
                    for slot in &mut state.slots {
                        slot.quit();
                    }
                    released.extend(state.server.drain_articles());
                }
                let mut queue = self.ctx.queue.lock().await;
                for article in released {
                    queue.reset_article(article, false);
                }
                info!("idle connections closed");
            }
        }
    }

    pub(super) async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Connected { server, slot, addr } => self.on_connected(server, slot, addr),
            WorkerEvent::Fetched {
                server,
                slot,
                article,
                reply,
            } => self.on_fetched(server, slot, article, reply).await,
            WorkerEvent::Failed {
                server,
                slot,
                article,
                error,
            } => self.on_failed(server, slot, article, error).await,
        }
    }

    fn on_connected(&mut self, server: ServerId, slot: usize, addr: SocketAddr) {
        let Some(state) = self.state_mut(server) else {
            return;
        };
        state.server.addr.set(addr, Instant::now());
        state.server.register_login();
        debug!(%server, slot, %addr, "connection ready");
    }

    async fn on_fetched(
        &mut self,
        server: ServerId,
        slot: usize,
        article: ArticleRef,
        reply: FetchReply,
    ) {
        let command = {
            let Some(state) = self.state_mut(server) else {
                return;
            };
            match state.slots.get_mut(slot).and_then(|s| s.busy.take()) {
                Some((busy, command)) if busy == article => command,
                other => {
                    warn!(%server, slot, %article, ?other, "result for an article the slot was not fetching");
                    return;
                }
            }
        };

        match reply {
            FetchReply::Body(data) => {
                self.decode(DecodeRequest {
                    article,
                    server,
                    outcome: ArticleOutcome::Fetched(data),
                })
                .await;
            }
            FetchReply::Present => {
                self.ctx.bps.record_article(server, true);
                self.decode(DecodeRequest {
                    article,
                    server,
                    outcome: ArticleOutcome::Present,
                })
                .await;
            }
            FetchReply::Missing => self.not_on_server(server, article).await,
            FetchReply::NoCommand => {
                let Some(state) = self.state_mut(server) else {
                    return;
                };
                let flipped = match command {
                    NntpCommand::Body => {
                        state.server.have_body = false;
                        true
                    }
                    NntpCommand::Stat => {
                        state.server.have_stat = false;
                        true
                    }
                    NntpCommand::Article | NntpCommand::Head => false,
                };
                if flipped {
                    info!(server = %state.server.name(), ?command, "command not supported, switching");
                    state.server.return_article(article);
                } else {
                    self.not_on_server(server, article).await;
                }
            }
        }

        let pause = self.ctx.config.download.downloader_sleep_time;
        if pause > 0 && self.ctx.bps.limit() == 0 {
            tokio::time::sleep(std::time::Duration::from_micros(pause)).await;
        }
    }

    /// `server` does not have `article`: try elsewhere or count it missing
    async fn not_on_server(&mut self, server: ServerId, article: ArticleRef) {
        self.ctx.bps.record_article(server, false);
        let retry = self.ctx.queue.lock().await.search_new_server(article, server);
        if retry {
            self.ctx.notify_queue();
        } else {
            self.decode(DecodeRequest {
                article,
                server,
                outcome: ArticleOutcome::Missing,
            })
            .await;
        }
    }

    async fn on_failed(
        &mut self,
        server: ServerId,
        slot: usize,
        article: Option<ArticleRef>,
        error: NntpError,
    ) {
        let now = Instant::now();
        let no_penalties = self.ctx.config.download.no_penalties;
        let max_tries = self.ctx.config.download.max_art_tries;
        let Some(state) = self.servers.iter_mut().find(|s| s.server.id == server) else {
            return;
        };
        if let Some(s) = state.slots.get_mut(slot) {
            s.worker = None;
            s.busy = None;
        }
        if matches!(error, NntpError::Connect { .. }) {
            state.server.addr.clear();
        }

        let class = classify_error(&error);
        let action = state.server.register_error(class, now, no_penalties);
        let name = state.server.name().to_string();
        warn!(server = %name, slot, error = %error, ?class, "connection failed");

        let mut lost = None;
        let mut queue = self.ctx.queue.lock().await;
        if let Some(article) = article {
            let exhausted = queue
                .article(article)
                .is_some_and(|a| a.tries() >= max_tries);
            if exhausted {
                if !queue.search_new_server(article, server) {
                    lost = Some(article);
                }
            } else {
                queue.reset_article(article, false);
            }
        }

        match action {
            ErrorAction::Reconnect { delay } => {
                if let Some(s) = state.slots.get_mut(slot) {
                    s.reconnect_at = Some(now + delay);
                }
            }
            ErrorAction::Disabled {
                penalty,
                stamp,
                schedule,
            } => {
                for article in state.server.drain_articles() {
                    queue.reset_article(article, false);
                }
                queue.set_server_active(server, false);
                for s in &mut state.slots {
                    if s.busy.is_none() {
                        s.quit();
                    }
                }
                if schedule {
                    self.ctx.scheduler.schedule(
                        penalty,
                        format!("reactivate {name}"),
                        Command::ReactivateServer { server, stamp },
                    );
                    self.ctx.emit(Event::ServerDisabled {
                        server: name,
                        reason: error.to_string(),
                        penalty,
                    });
                }
            }
        }
        drop(queue);
        self.ctx.notify_queue();

        if let Some(article) = lost {
            self.decode(DecodeRequest {
                article,
                server,
                outcome: ArticleOutcome::Missing,
            })
            .await;
        }
    }

    /// Recover slots whose worker died without reporting
    pub(super) async fn reap_workers(&mut self) {
        let mut orphaned = Vec::new();
        for state in &mut self.servers {
            for (index, slot) in state.slots.iter_mut().enumerate() {
                if slot.worker.as_ref().is_some_and(|w| w.task.is_finished()) {
                    slot.worker = None;
                    if let Some((article, _)) = slot.busy.take() {
                        error!(server = %state.server.id, slot = index, %article, "worker stopped without a report");
                        orphaned.push(article);
                    }
                }
            }
        }
        if orphaned.is_empty() {
            return;
        }
        let mut queue = self.ctx.queue.lock().await;
        for article in orphaned {
            queue.reset_article(article, false);
        }
    }
}
