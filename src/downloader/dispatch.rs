//! Handing articles to idle connection slots

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{self, error::SendError};
use tracing::{debug, trace, warn};

use super::{Downloader, ServerState};
use crate::decoder::DecodeRequest;
use crate::engine::Context;
use crate::job::ArticleOutcome;
use crate::nntp::worker::{self, FetchRequest, WorkerCommand, WorkerSpec};
use crate::nntp::{Command as NntpCommand, Request};
use crate::persistence;
use crate::queue::{NzbQueue, PendingImport};
use crate::server::Server;
use crate::types::{ArticleRef, ServerId};

/// Wire request for `article` on `server`, or `None` when the article is no
/// longer claimed by this server
pub(super) fn build_request(server: &Server, queue: &NzbQueue, article: ArticleRef) -> Option<Request> {
    let job = queue.get(article.job)?;
    let file = job.file(article.file)?;
    let art = file.article(article.index)?;
    if art.fetcher() != Some(server.id) || !art.is_pending() {
        return None;
    }
    let command = match (job.precheck, server.have_stat, server.have_body) {
        (true, true, _) => NntpCommand::Stat,
        (true, false, _) => NntpCommand::Head,
        (false, _, true) => NntpCommand::Body,
        (false, _, false) => NntpCommand::Article,
    };
    let group = server
        .config
        .send_group
        .then(|| file.groups.first().cloned())
        .flatten();
    Some(Request {
        message_id: art.message_id.clone(),
        group,
        command,
    })
}

impl Downloader {
    /// One pass over all servers
    pub(super) async fn dispatch(&mut self) {
        let now = Instant::now();
        let force_only = self.paused;
        let mut lost = Vec::new();

        let mut queue = self.ctx.queue.lock().await;
        if !queue.has_work(force_only) {
            if self.ctx.config.download.autodisconnect {
                for state in &mut self.servers {
                    for slot in state.slots.iter_mut().filter(|s| s.busy.is_none()) {
                        slot.quit();
                    }
                }
            }
            return;
        }

        for state in &mut self.servers {
            if !state.server.active {
                continue;
            }
            fill_slots(
                &self.ctx,
                state,
                &mut queue,
                now,
                force_only,
                &self.events_tx,
                &mut lost,
            );
        }
        let imports = queue.take_imports();
        drop(queue);

        for (article, server) in lost {
            self.decode(DecodeRequest {
                article,
                server,
                outcome: ArticleOutcome::Missing,
            })
            .await;
        }
        for import in imports {
            spawn_import(Arc::clone(&self.ctx), import);
        }
    }
}

fn fill_slots(
    ctx: &Arc<Context>,
    state: &mut ServerState,
    queue: &mut NzbQueue,
    now: Instant,
    force_only: bool,
    events: &mpsc::UnboundedSender<worker::WorkerEvent>,
    lost: &mut Vec<(ArticleRef, ServerId)>,
) {
    let server_id = state.server.id;
    for index in 0..state.slots.len() {
        let slot = &state.slots[index];
        if slot.busy.is_some() || slot.reconnect_at.is_some_and(|at| now < at) {
            continue;
        }

        let fetch = loop {
            let prefetch = state.server.next_article(queue, now, force_only);
            for article in prefetch.expired {
                if !queue.search_new_server(article, server_id) {
                    lost.push((article, server_id));
                }
            }
            let Some(article) = prefetch.article else {
                break None;
            };
            match build_request(&state.server, queue, article) {
                Some(request) => break Some(FetchRequest { article, request }),
                None => trace!(server = %server_id, %article, "skipping stale prefetched article"),
            }
        };
        let Some(fetch) = fetch else {
            return;
        };

        let slot = &mut state.slots[index];
        slot.reconnect_at = None;
        slot.busy = Some((fetch.article, fetch.request.command));
        let fetch = match &slot.worker {
            Some(worker) => match worker.commands.send(WorkerCommand::Fetch(fetch)) {
                Ok(()) => continue,
                Err(SendError(command)) => {
                    warn!(server = %server_id, slot = index, "worker gone, reconnecting");
                    let WorkerCommand::Fetch(fetch) = command else {
                        continue;
                    };
                    fetch
                }
            },
            None => fetch,
        };
        debug!(server = %server_id, slot = index, "opening connection");
        let spec = WorkerSpec {
            server: server_id,
            slot: index,
            config: state.server.config.clone(),
            tls: state.tls.clone(),
            addr: state.server.addr.get(now),
        };
        slot.worker = Some(worker::spawn(
            spec,
            fetch,
            ctx.bps.clone(),
            events.clone(),
            ctx.shutdown.clone(),
        ));
    }
}

/// Load an article table in the background and install it
fn spawn_import(ctx: Arc<Context>, import: PendingImport) {
    tokio::spawn(async move {
        let PendingImport { job, file, path } = import;
        match persistence::load_article_table(&path).await {
            Ok(table) => {
                debug!(job_id = %job, file = file.0, articles = table.len(), "article table loaded");
                ctx.queue.lock().await.install_articles(job, file, table);
            }
            Err(e) => {
                warn!(job_id = %job, path = %path.display(), error = %e, "failed to load article table");
                ctx.queue.lock().await.import_failed(job, file);
            }
        }
        ctx.notify_queue();
    });
}
