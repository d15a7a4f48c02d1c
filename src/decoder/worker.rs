//! Decoder workers
//!
//! A small pool of tasks shares one request channel. Each request carries
//! what a connection delivered for one article; the worker decodes it off
//! the async threads, stores the payload in the cache and registers the
//! outcome on the job under the queue lock.

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::yenc::{self, YencPart};
use crate::deobfuscation::is_obfuscated;
use crate::engine::Context;
use crate::job::{ArticleOutcome, Registered};
use crate::queue::NzbQueue;
use crate::types::{ArticleRef, Event, JobId, ServerId};
use crate::utils::hex_string;

/// Bytes hashed for the first-16k MD5
const MD5_PREFIX: usize = 16 * 1024;

/// One article result on its way to the decoder
#[derive(Debug)]
pub(crate) struct DecodeRequest {
    /// Article the result belongs to
    pub article: ArticleRef,
    /// Server that produced it
    pub server: ServerId,
    /// What the server delivered
    pub outcome: ArticleOutcome,
}

/// Start `count` workers reading from `rx`
pub(crate) fn spawn_workers(
    ctx: Arc<Context>,
    rx: mpsc::Receiver<DecodeRequest>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count.max(1))
        .map(|worker| {
            let ctx = Arc::clone(&ctx);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let request = rx.lock().await.recv().await;
                    let Some(request) = request else { break };
                    handle(&ctx, request).await;
                }
                debug!(worker, "decoder worker stopped");
            })
        })
        .collect()
}

/// Process one request
pub(crate) async fn handle(ctx: &Context, request: DecodeRequest) {
    let DecodeRequest {
        article,
        server,
        outcome,
    } = request;
    match outcome {
        ArticleOutcome::Fetched(raw) => {
            match tokio::task::spawn_blocking(move || yenc::decode(&raw)).await {
                Ok(Ok(part)) => store_part(ctx, article, server, part).await,
                Ok(Err(e)) => {
                    debug!(%article, %server, error = %e, "article failed to decode");
                    ctx.bps.record_article(server, false);
                    retry_elsewhere(ctx, article, server).await;
                }
                Err(e) => {
                    error!(%article, error = %e, "decode task failed");
                    ctx.queue.lock().await.reset_article(article, false);
                    ctx.notify_queue();
                }
            }
        }
        ArticleOutcome::Present => register(ctx, article, true).await,
        ArticleOutcome::Missing => register(ctx, article, false).await,
    }
}

/// Treat a corrupt article like a missing one on this server
async fn retry_elsewhere(ctx: &Context, article: ArticleRef, server: ServerId) {
    let retry = ctx.queue.lock().await.search_new_server(article, server);
    if retry {
        ctx.notify_queue();
    } else {
        register(ctx, article, false).await;
    }
}

async fn register(ctx: &Context, article: ArticleRef, success: bool) {
    let mut queue = ctx.queue.lock().await;
    let Some(registered) = queue.register_article(article, success, &ctx.config.download) else {
        return;
    };
    let file_done = registered.file_done;
    after_register(ctx, &mut queue, article.job, registered);
    drop(queue);
    if file_done {
        ctx.assemble(article);
    }
}

/// Apply the side effects of a registration while the queue is locked
fn after_register(ctx: &Context, queue: &mut NzbQueue, job: JobId, registered: Registered) {
    if let Some(setname) = registered.promoted_set {
        ctx.emit(Event::Par2Promoted {
            id: job,
            setname,
            blocks: registered.promoted_blocks,
        });
        ctx.notify_queue();
    }
    if let Some(reason) = registered.hopeless {
        ctx.fail_job(queue, job, reason);
    }
}

async fn store_part(ctx: &Context, article: ArticleRef, server: ServerId, part: YencPart) {
    ctx.bps.record_article(server, true);

    let (admin, obfuscated) = {
        let queue = ctx.queue.lock().await;
        let Some(job) = queue.get(article.job).filter(|j| !j.is_cancelled()) else {
            return;
        };
        let Some(file) = job.file(article.file) else {
            return;
        };
        if !file.article(article.index).is_some_and(|a| a.is_pending()) {
            debug!(%article, "dropping payload of resolved article");
            return;
        }
        (
            job.admin_path.clone(),
            ctx.config.processing.deobfuscation.enabled && is_obfuscated(&file.filename),
        )
    };

    let YencPart {
        data,
        name,
        file_size,
        begin,
        crc32,
        file_crc32,
        ..
    } = part;
    let size = data.len() as u64;
    let md5of16k = (article.index == 0
        && (data.len() >= MD5_PREFIX || file_size == Some(size)))
    .then(|| md5::compute(&data[..data.len().min(MD5_PREFIX)]).0);

    let cache = ctx.cache.clone();
    let stored = tokio::task::spawn_blocking(move || cache.store(article, &admin, data)).await;
    match stored {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            if e.is_disk_full() {
                ctx.report_disk_full(&e.to_string());
            } else {
                warn!(%article, error = %e, "failed to cache article");
            }
            ctx.queue.lock().await.reset_article(article, false);
            return;
        }
        Err(e) => {
            error!(%article, error = %e, "cache task failed");
            ctx.queue.lock().await.reset_article(article, false);
            return;
        }
    }

    let mut queue = ctx.queue.lock().await;
    let Some(job) = queue.get_mut(article.job) else {
        ctx.cache.purge(&[article]);
        return;
    };

    let known_name = md5of16k.and_then(|hash| job.md5of16k.get(&hex_string(&hash)).cloned());
    let mut renamed = None;
    if let Some(file) = job.file_mut(article.file) {
        file.record_segment(article.index, crc32, size, begin);
        if file.expected_crc.is_none() {
            file.expected_crc = file_crc32;
        }
        if let Some(hash) = md5of16k
            && obfuscated
        {
            file.md5of16k = Some(hash);
        }
        let better = known_name.or_else(|| {
            name.filter(|n| obfuscated && article.index == 0 && !n.is_empty() && !is_obfuscated(n))
        });
        if let Some(new) = better
            && new != file.filename
        {
            let old = std::mem::replace(&mut file.filename, new.clone());
            file.classify_par2();
            renamed = Some((old, new));
        }
    }
    if let Some((old, new)) = renamed {
        let original = job.renames.remove(&old).unwrap_or_else(|| old.clone());
        job.renames.insert(new.clone(), original);
        debug!(job_id = %job.id, old = %old, new = %new, "renamed file from first article");
        ctx.emit(Event::FileRenamed {
            id: job.id,
            old_name: old,
            new_name: new,
        });
    }
    job.saved_articles.insert((article.file, article.index));

    if let Some(registered) = queue.register_article(article, true, &ctx.config.download) {
        after_register(ctx, &mut queue, article.job, registered);
    }
    drop(queue);
    ctx.assemble(article);
}
