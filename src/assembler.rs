//! File assembly
//!
//! One task owns every write into the incomplete directories. For each
//! request it moves the cached payloads of one file to their offsets on
//! disk, and once the file has no pending articles it finalizes it:
//!
//! 1. the combined CRC32 is checked against the yEnc trailers
//! 2. a finished par2 file is parsed and its first-16k hashes rename
//!    obfuscated files
//! 3. a finished RAR volume is offered to the direct unpacker
//!
//! When the last file of a job is finalized the job leaves the queue for
//! post-processing (or, after a pre-check, is either re-queued for download
//! or failed).
//!
//! Because renames can happen while a file is half written, the task keeps
//! the path each file was last written to and moves it before writing more.
//!
//! A file whose write fails is parked until the downloader resumes, then
//! assembled again from what is still cached.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::directunpack::UnpackJob;
use crate::engine::Context;
use crate::error::{Error, Result};
use crate::par2::parse_par2_file;
use crate::persistence;
use crate::types::{ArticleRef, Event, FileId, JobId};
use crate::utils::write_all_at;

/// Ask the assembler to look at one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AssembleRequest {
    /// Owning job
    pub job: JobId,
    /// File with new payloads or no pending articles
    pub file: FileId,
}

/// Payloads of one file to write, with their file offsets
struct WritePlan {
    path: PathBuf,
    previous: Option<PathBuf>,
    admin: PathBuf,
    articles: Vec<(ArticleRef, u64)>,
}

/// What finalizing a file needs after the queue lock is released
struct Finalized {
    path: PathBuf,
    filename: String,
    crc_ok: bool,
    par2_set: Option<String>,
    unpack: UnpackJob,
}

#[derive(Default)]
struct Assembler {
    written: HashMap<(JobId, FileId), PathBuf>,
    /// Files whose last write failed
    stalled: HashSet<AssembleRequest>,
}

/// Start the assembler task
pub(crate) fn spawn(
    ctx: Arc<Context>,
    mut rx: mpsc::UnboundedReceiver<AssembleRequest>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut assembler = Assembler::default();
        loop {
            tokio::select! {
                request = rx.recv() => match request {
                    Some(request) => assembler.handle(&ctx, request).await,
                    None => break,
                },
                () = ctx.assembly_retry.notified() => assembler.retry(&ctx).await,
            }
        }
        debug!("assembler stopped");
    })
}

impl Assembler {
    async fn handle(&mut self, ctx: &Context, request: AssembleRequest) {
        match self.process(ctx, request).await {
            Ok(()) => {
                self.stalled.remove(&request);
            }
            Err(e) => {
                self.stalled.insert(request);
                if e.is_disk_full() {
                    ctx.report_disk_full(&e.to_string());
                } else {
                    error!(job_id = %request.job, file = %request.file, error = %e, "assembly failed, retrying on resume");
                }
            }
        }
    }

    /// Assemble every stalled file again
    async fn retry(&mut self, ctx: &Context) {
        let stalled: Vec<AssembleRequest> = self.stalled.drain().collect();
        if stalled.is_empty() {
            return;
        }
        info!(files = stalled.len(), "retrying stalled file assembly");
        for request in stalled {
            self.handle(ctx, request).await;
        }
    }

    async fn process(&mut self, ctx: &Context, request: AssembleRequest) -> Result<()> {
        let key = (request.job, request.file);
        let Some(plan) = self.plan(ctx, request).await else {
            self.written.retain(|(job, _), _| *job != request.job);
            return Ok(());
        };

        if !plan.articles.is_empty() {
            let cache = ctx.cache.clone();
            let path = plan.path.clone();
            let written = tokio::task::spawn_blocking(move || write_payloads(&cache, plan))
                .await
                .map_err(|e| Error::Other(format!("assembler write task failed: {e}")))?;
            self.written.insert(key, path);
            let (done, failure) = written;
            let mut queue = ctx.queue.lock().await;
            if let Some(job) = queue.get_mut(request.job) {
                for article in &done {
                    job.saved_articles.remove(&(article.file, article.index));
                }
            }
            drop(queue);
            if let Some(e) = failure {
                return Err(e);
            }
        }

        if let Some(finalized) = self.finalize(ctx, request).await {
            self.after_finalize(ctx, request, finalized).await;
        }
        finish_if_done(ctx, request.job).await;
        Ok(())
    }

    /// Collect the cached payloads of a file under the queue lock
    async fn plan(&self, ctx: &Context, request: AssembleRequest) -> Option<WritePlan> {
        let queue = ctx.queue.lock().await;
        let job = queue.get(request.job).filter(|j| !j.is_cancelled())?;
        let file = job.file(request.file)?;
        let first_size = file
            .article(0)
            .and_then(|a| a.decoded_size)
            .unwrap_or(0);
        let articles = job
            .saved_articles
            .range((request.file, 0)..=(request.file, u32::MAX))
            .filter_map(|&(_, index)| {
                let article = file.article(index)?;
                let offset = article
                    .data_begin
                    .unwrap_or_else(|| u64::from(index) * first_size);
                Some((
                    ArticleRef {
                        job: request.job,
                        file: request.file,
                        index,
                    },
                    offset,
                ))
            })
            .collect();
        Some(WritePlan {
            path: job.download_path.join(&file.filename),
            previous: self.written.get(&(request.job, request.file)).cloned(),
            admin: job.admin_path.clone(),
            articles,
        })
    }

    /// Mark a file finalized once nothing of it is pending or cached
    async fn finalize(&self, ctx: &Context, request: AssembleRequest) -> Option<Finalized> {
        let mut queue = ctx.queue.lock().await;
        let job = queue.get_mut(request.job)?;
        let pending_saved = job
            .saved_articles
            .range((request.file, 0)..=(request.file, u32::MAX))
            .next()
            .is_some();
        let precheck = job.precheck;
        let unpack = UnpackJob {
            id: job.id,
            download_path: job.download_path.clone(),
            password: job.password.clone(),
            unpack: job.post_process.unpack(),
        };
        let download_path = job.download_path.clone();
        let file = job.file_mut(request.file)?;
        if !file.completed || file.assembled || pending_saved {
            return None;
        }
        file.assembled = true;
        if precheck {
            return None;
        }
        let crc_ok = file.crc_ok();
        if !crc_ok {
            warn!(job_id = %request.job, filename = %file.filename, "file crc does not match its segments");
        }
        Some(Finalized {
            path: download_path.join(&file.filename),
            filename: file.filename.clone(),
            crc_ok,
            par2_set: file.is_par2.then(|| file.setname.clone()).flatten(),
            unpack,
        })
    }

    async fn after_finalize(&mut self, ctx: &Context, request: AssembleRequest, file: Finalized) {
        debug!(job_id = %request.job, filename = %file.filename, crc_ok = file.crc_ok, "file assembled");
        ctx.emit(Event::FileCompleted {
            id: request.job,
            filename: file.filename.clone(),
            crc_ok: file.crc_ok,
        });

        if let Some(setname) = file.par2_set
            && file.path.is_file()
        {
            self.apply_par2(ctx, request.job, &setname, file.path.clone())
                .await;
        }

        if file.path.is_file() {
            ctx.direct_unpack
                .volume_done(&file.unpack, &file.filename, file.crc_ok);
        }
    }

    /// Read a finished par2 file and rename the files it identifies
    async fn apply_par2(&mut self, ctx: &Context, job_id: JobId, setname: &str, path: PathBuf) {
        let parsed = tokio::task::spawn_blocking(move || parse_par2_file(&path)).await;
        let pack = match parsed {
            Ok(Ok(pack)) => pack,
            Ok(Err(e)) => {
                warn!(job_id = %job_id, setname, error = %e, "failed to read par2 file");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "par2 parse task failed");
                return;
            }
        };

        let mut queue = ctx.queue.lock().await;
        let Some(job) = queue.get_mut(job_id) else {
            return;
        };
        let renamed = job.apply_par2_pack(setname, pack.files);
        if renamed.is_empty() {
            return;
        }
        let mut moves = Vec::new();
        for (file, _, new) in &renamed {
            if let Some(old_path) = self.written.get(&(job_id, *file)) {
                moves.push((*file, old_path.clone(), job.download_path.join(new)));
            }
            if let Some(nzf) = job.file_mut(*file) {
                nzf.classify_par2();
            }
        }
        let renames = job.renames.clone();
        let admin = job.admin_path.clone();
        drop(queue);

        for (file, old_path, new_path) in moves {
            match tokio::fs::rename(&old_path, &new_path).await {
                Ok(()) => {
                    self.written.insert((job_id, file), new_path);
                }
                Err(e) => {
                    warn!(job_id = %job_id, from = %old_path.display(), error = %e, "failed to rename file on disk");
                }
            }
        }

        if let Err(e) = persistence::save_renames(&admin, &renames).await {
            warn!(job_id = %job_id, error = %e, "failed to save rename log");
        }
        for (_, old, new) in renamed {
            ctx.emit(Event::FileRenamed {
                id: job_id,
                old_name: old,
                new_name: new,
            });
        }
    }
}

/// Move cached payloads to disk; returns the articles written and the
/// error that stopped the batch, if any
fn write_payloads(
    cache: &crate::cache::ArticleCache,
    plan: WritePlan,
) -> (Vec<ArticleRef>, Option<Error>) {
    let mut done = Vec::with_capacity(plan.articles.len());
    let file = (|| -> std::io::Result<std::fs::File> {
        if let Some(parent) = plan.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(previous) = &plan.previous
            && *previous != plan.path
            && previous.exists()
        {
            std::fs::rename(previous, &plan.path)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&plan.path)
    })();
    let file = match file {
        Ok(file) => file,
        Err(e) => return (done, Some(write_error(&plan.path, e))),
    };

    for (article, offset) in plan.articles {
        let data = match cache.load(article) {
            Ok(Some(data)) => data,
            Ok(None) => {
                // purged or already written
                done.push(article);
                continue;
            }
            Err(e) => return (done, Some(e)),
        };
        if let Err(e) = write_all_at(&file, &data, offset) {
            if let Err(e) = cache.store(article, &plan.admin, data) {
                error!(%article, error = %e, "lost article payload after a failed write");
            }
            return (done, Some(write_error(&plan.path, e)));
        }
        done.push(article);
    }
    (done, None)
}

fn write_error(path: &std::path::Path, e: std::io::Error) -> Error {
    if crate::error::is_disk_full_io(&e) {
        Error::DiskFull {
            path: path.to_path_buf(),
        }
    } else {
        Error::Io(e)
    }
}

/// Hand a job on once all its files are finalized
pub(crate) async fn finish_if_done(ctx: &Context, id: JobId) {
    let mut queue = ctx.queue.lock().await;
    let Some(job) = queue.get_mut(id) else {
        return;
    };
    if !job.is_done() {
        return;
    }

    if job.precheck {
        let (enough, ratio) = job.check_availability_ratio(ctx.config.download.req_completion_rate);
        if enough || job.bytes_missing == 0 {
            info!(job_id = %id, ratio, "pre-check passed, downloading");
            job.reset_for_download();
            drop(queue);
            ctx.notify_queue();
        } else {
            ctx.fail_job(
                &mut queue,
                id,
                format!("pre-check found only {ratio:.1}% of the data"),
            );
        }
        return;
    }

    let Some(job) = queue.take(id) else {
        return;
    };
    drop(queue);
    info!(job_id = %id, name = %job.name, bad_articles = job.bad_articles, "download complete");
    ctx.emit(Event::DownloadComplete {
        id,
        bad_articles: job.bad_articles,
    });
    ctx.post_process(job);
}
