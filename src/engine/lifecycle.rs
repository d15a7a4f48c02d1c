//! Startup, restore, progress reporting and shutdown

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Context, Engine};
use crate::downloader::Command;
use crate::error::{Error, Result};
use crate::job::NzbObject;
use crate::persistence::{self, JobRef};
use crate::types::{ArticleRef, Event, FileId, JobId, Status};
use crate::utils::get_available_space;
use crate::{assembler, decoder, downloader, postproc};

/// How often progress and free space are checked
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// How long shutdown waits for the downloader loop to let go of its sockets
const DOWNLOADER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl Engine {
    /// Start the downloader, decoder workers, assembler and post-processor
    ///
    /// Can be called once per engine.
    pub fn start(&self) -> Result<()> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Other("engine already started".into()))?;

        let ctx = &self.ctx;
        let mut tasks = Vec::new();
        tasks.push(downloader::spawn(Arc::clone(ctx), receivers.downloader));
        tasks.extend(decoder::spawn_workers(
            Arc::clone(ctx),
            receivers.decoder,
            ctx.config.download.receive_threads,
        ));
        tasks.push(assembler::spawn(Arc::clone(ctx), receivers.assembler));
        tasks.push(postproc::spawn(Arc::clone(ctx), receivers.postproc));
        tasks.push(spawn_monitor(Arc::clone(ctx)));
        let count = tasks.len();
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        info!(tasks = count, "engine started");
        Ok(())
    }

    /// Stop everything and save the queue
    ///
    /// New jobs are refused, connections are dropped without `QUIT`, cached
    /// payloads are spilled to the admin directories and every queued job is
    /// snapshotted before `queue.sab` is written. Running post-processing is
    /// interrupted and starts over on the next run.
    pub async fn shutdown(&self) -> Result<()> {
        let ctx = &self.ctx;
        info!("initiating graceful shutdown");
        ctx.accepting.store(false, Ordering::SeqCst);
        ctx.emit(Event::Shutdown);
        ctx.shutdown.cancel();

        let mut tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !tasks.is_empty() {
            // the downloader is spawned first
            let downloader = tasks.remove(0);
            if tokio::time::timeout(DOWNLOADER_STOP_TIMEOUT, downloader)
                .await
                .is_err()
            {
                warn!("downloader did not stop in time");
            }
        }
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let cache = ctx.cache.clone();
        match tokio::task::spawn_blocking(move || cache.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to spill the article cache"),
            Err(e) => error!(error = %e, "cache flush task failed"),
        }

        let jobs: Vec<NzbObject> = ctx.queue.lock().await.jobs().to_vec();
        for job in &jobs {
            if let Err(e) = persistence::save_job(job).await {
                error!(job_id = %job.id, error = %e, "failed to save job snapshot");
            }
        }
        ctx.save_queue().await?;
        info!(jobs = jobs.len(), "graceful shutdown complete");
        Ok(())
    }
}

/// Load `queue.sab` and put its jobs back
pub(super) async fn restore(ctx: &Context) -> Result<()> {
    let Some(file) = persistence::load_queue(ctx.config.admin_dir()).await? else {
        return Ok(());
    };

    let mut restored = 0;
    for job_ref in &file.jobs {
        let Some(mut job) = load(ctx, job_ref).await else {
            continue;
        };
        if matches!(job.status, Status::Downloading | Status::Checking) {
            job.status = Status::Queued;
        }
        let files = adopt_saved_articles(ctx, &mut job).await;
        let id = job.id;
        ctx.queue.lock().await.add(job);
        for file in files {
            ctx.assemble(ArticleRef { job: id, file, index: 0 });
        }
        restored += 1;
    }

    for job_ref in &file.postproc {
        if let Some(job) = load(ctx, job_ref).await {
            ctx.post_process(job);
        }
    }

    *ctx
        .recent_history
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = file.history.into_iter().collect();
    info!(
        jobs = restored,
        post_processing = file.postproc.len(),
        "queue restored"
    );
    Ok(())
}

async fn load(ctx: &Context, job_ref: &JobRef) -> Option<NzbObject> {
    let admin = job_ref.admin_path(ctx.config.download_dir());
    match persistence::load_job(&admin, job_ref.id).await {
        Ok(mut job) => {
            job.admin_path = admin;
            Some(job)
        }
        Err(e) => {
            warn!(job_id = %job_ref.id, folder = %job_ref.folder, error = %e, "failed to restore job");
            None
        }
    }
}

/// Register the spill files of a restored job with the cache
///
/// Returns the files that have data waiting to be written (or are complete
/// but not finalized); their article tables are loaded right away so the
/// assembler can place the payloads.
async fn adopt_saved_articles(ctx: &Context, job: &mut NzbObject) -> Vec<FileId> {
    let saved: Vec<(FileId, u32)> = job.saved_articles.iter().copied().collect();
    for (file, index) in saved {
        let article = ArticleRef {
            job: job.id,
            file,
            index,
        };
        if !ctx.cache.adopt(article, &job.admin_path) {
            warn!(%article, "cached article is gone, the file will have a gap");
            job.saved_articles.remove(&(file, index));
        }
    }

    let pending: Vec<FileId> = job
        .files
        .iter()
        .filter(|f| {
            (f.completed && !f.assembled)
                || job
                    .saved_articles
                    .range((f.id, 0)..=(f.id, u32::MAX))
                    .next()
                    .is_some()
        })
        .map(|f| f.id)
        .collect();
    for id in &pending {
        let path = job.admin_path.join(id.table_name());
        match persistence::load_article_table(&path).await {
            Ok(table) => {
                if let Some(file) = job.file_mut(*id) {
                    file.install_articles(table);
                }
            }
            Err(e) => warn!(job_id = %job.id, file = %id, error = %e, "failed to load article table"),
        }
    }
    pending
}

/// Start the task that reports progress and watches free disk space
fn spawn_monitor(ctx: Arc<Context>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MONITOR_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut statuses = HashMap::new();
        let mut low_space = false;
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            report_progress(&ctx, &mut statuses).await;
            check_free_space(&ctx, &mut low_space);
        }
        debug!("monitor stopped");
    })
}

/// Emit status changes and download progress of queued jobs
async fn report_progress(ctx: &Context, statuses: &mut HashMap<JobId, Status>) {
    let speed_bps = ctx.bps.rate();
    let mut changed = Vec::new();
    let mut progress = Vec::new();
    {
        let queue = ctx.queue.lock().await;
        let mut current = HashMap::with_capacity(queue.len());
        for job in queue.jobs() {
            match statuses.get(&job.id) {
                Some(previous) if *previous != job.status => changed.push((job.id, job.status)),
                None if job.status != Status::Queued => changed.push((job.id, job.status)),
                _ => {}
            }
            if job.status == Status::Downloading {
                progress.push((job.id, job.percent()));
            }
            current.insert(job.id, job.status);
        }
        *statuses = current;
    }
    for (id, status) in changed {
        ctx.emit(Event::StatusChanged { id, status });
    }
    for (id, percent) in progress {
        ctx.emit(Event::Downloading {
            id,
            percent,
            speed_bps,
        });
    }
}

/// Pause while the incomplete directory is short of `min_free_space`
fn check_free_space(ctx: &Context, low_space: &mut bool) {
    let required = ctx.config.download.min_free_space;
    if required == 0 {
        return;
    }
    let available = match get_available_space(ctx.config.download_dir()) {
        Ok(available) => available,
        Err(e) => {
            debug!(error = %e, "could not read free disk space");
            return;
        }
    };
    if available < required && !*low_space {
        *low_space = true;
        warn!(available, required, "free disk space below minimum, pausing");
        ctx.command(Command::Pause);
        ctx.emit(Event::Warning {
            message: format!(
                "download paused: {available} bytes free, {required} bytes required"
            ),
        });
    } else if available >= required && *low_space {
        *low_space = false;
        info!(available, "free disk space recovered, resuming");
        ctx.command(Command::Resume);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_context;
    use crate::job::test_helpers::{job, test_config};
    use tempfile::TempDir;

    #[tokio::test]
    async fn progress_reports_changes_once() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &[0]);
        let j = job(&config, &[("a.bin", 2, 10)]);
        let id = j.id;
        let (ctx, _rx) = test_context(config);
        let mut events = ctx.events.subscribe();
        ctx.queue.lock().await.add(j);

        let mut statuses = HashMap::new();
        report_progress(&ctx, &mut statuses).await;
        assert!(events.try_recv().is_err(), "a freshly queued job is not a change");

        ctx.queue.lock().await.pause_job(id).unwrap();
        report_progress(&ctx, &mut statuses).await;
        match events.try_recv().unwrap() {
            Event::StatusChanged { id: got, status } => {
                assert_eq!((got, status), (id, Status::Paused));
            }
            other => panic!("unexpected event {other:?}"),
        }
        report_progress(&ctx, &mut statuses).await;
        assert!(events.try_recv().is_err(), "unchanged status is not repeated");
    }

    #[tokio::test]
    async fn restore_adopts_spilled_articles_and_drops_lost_ones() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &[0]);
        let mut j = job(&config, &[("a.bin", 3, 10)]);
        let file = j.files[0].id;
        j.status = Status::Downloading;
        j.saved_articles.insert((file, 0));
        j.saved_articles.insert((file, 1));
        persistence::save_job(&j).await.unwrap();
        let kept = ArticleRef {
            job: j.id,
            file,
            index: 0,
        };
        std::fs::write(
            j.admin_path.join(crate::cache::spill_name(kept)),
            b"payload",
        )
        .unwrap();
        persistence::save_queue(
            &config.persistence.admin_dir,
            &persistence::QueueFile::new(vec![crate::engine::job_ref(&j)], vec![], vec![]),
        )
        .await
        .unwrap();

        let (ctx, mut rx) = test_context(config);
        restore(&ctx).await.unwrap();

        let queue = ctx.queue.lock().await;
        let restored = queue.get(j.id).expect("job restored");
        assert_eq!(restored.status, Status::Queued, "active states restart from queued");
        assert_eq!(
            restored.saved_articles.iter().copied().collect::<Vec<_>>(),
            vec![(file, 0)],
            "the article without a spill file is dropped"
        );
        assert!(
            restored.files[0].import_finished,
            "the table of a file with saved data is loaded"
        );
        assert_eq!(ctx.cache.load(kept).unwrap(), Some(b"payload".to_vec()));
        let request = rx.assembler.try_recv().unwrap();
        assert_eq!((request.job, request.file), (j.id, file));
    }

    #[tokio::test]
    async fn restore_refuses_other_queue_versions() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), &[0]);
        std::fs::create_dir_all(&config.persistence.admin_dir).unwrap();
        std::fs::write(
            config.persistence.admin_dir.join(persistence::QUEUE_FILE),
            br#"{"version": 99, "jobs": []}"#,
        )
        .unwrap();
        let (ctx, _rx) = test_context(config);
        assert!(matches!(
            restore(&ctx).await,
            Err(Error::QueueVersion { found: 99, .. })
        ));
    }
}
