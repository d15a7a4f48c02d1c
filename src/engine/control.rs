//! Queue and downloader control

use std::sync::atomic::Ordering;

use tracing::{info, warn};

use super::Engine;
use crate::downloader::Command;
use crate::error::{DownloadError, Error, Result};
use crate::persistence;
use crate::scheduler::ScheduledTask;
use crate::types::{Event, HistoryEntry, JobId, Priority, QueueStats, ServerId, Status};

impl Engine {
    /// Remove a job from the queue and delete its files
    ///
    /// In-flight articles of the job are dropped when they come back.
    pub async fn remove_job(&self, id: JobId) -> Result<()> {
        let job = self
            .ctx
            .queue
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| Error::Download(DownloadError::NotFound { id: id.to_string() }))?;
        self.ctx.cache.purge_job(id);
        self.ctx.command(Command::ForgetJob(id));
        self.ctx.notify_queue();

        if let Err(e) = tokio::fs::remove_dir_all(&job.download_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(job_id = %id, error = %e, "failed to delete job directory");
        }
        info!(job_id = %id, name = %job.name, "job deleted");
        self.ctx.emit(Event::Removed { id });
        self.ctx.persist_queue().await;
        Ok(())
    }

    /// Pause one job
    pub async fn pause_job(&self, id: JobId) -> Result<()> {
        self.ctx.queue.lock().await.pause_job(id)?;
        self.ctx.emit(Event::StatusChanged {
            id,
            status: Status::Paused,
        });
        self.ctx.persist_queue().await;
        Ok(())
    }

    /// Resume one paused job
    pub async fn resume_job(&self, id: JobId) -> Result<()> {
        let status = {
            let mut queue = self.ctx.queue.lock().await;
            queue.resume_job(id)?;
            queue.get(id).map(|j| j.status)
        };
        if let Some(status) = status {
            self.ctx.emit(Event::StatusChanged { id, status });
        }
        self.ctx.notify_queue();
        self.ctx.persist_queue().await;
        Ok(())
    }

    /// Change a job's priority; returns its new queue position
    ///
    /// [`Priority::Stop`] cannot be set on a queued job.
    pub async fn set_priority(&self, id: JobId, priority: Priority) -> Result<usize> {
        let position = self.ctx.queue.lock().await.set_priority(id, priority)?;
        self.ctx.notify_queue();
        self.ctx.persist_queue().await;
        Ok(position)
    }

    /// Move a job to `index` in the queue; returns the position it ended up at
    pub async fn move_job(&self, id: JobId, index: usize) -> Result<usize> {
        let position = self.ctx.queue.lock().await.move_job(id, index)?;
        self.ctx.notify_queue();
        self.ctx.persist_queue().await;
        Ok(position)
    }

    /// Stop handing out articles; `Force` jobs keep downloading
    pub fn pause(&self) {
        self.ctx.command(Command::Pause);
    }

    /// Hand out articles again
    pub fn resume(&self) {
        self.ctx.command(Command::Resume);
    }

    /// Whether the downloader is paused
    pub fn is_paused(&self) -> bool {
        self.ctx.paused.load(Ordering::SeqCst)
    }

    /// Set the bandwidth limit in bytes per second (0 = unlimited)
    pub fn set_bandwidth_limit(&self, limit_bps: u64) {
        info!(limit_bps, "bandwidth limit changed");
        self.ctx.bps.set_limit(limit_bps);
    }

    /// Queue overview
    pub async fn queue_stats(&self) -> QueueStats {
        let jobs = self.ctx.queue.lock().await.summaries();
        let post_processing = self
            .ctx
            .post_processing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len();
        QueueStats {
            jobs,
            post_processing,
            paused: self.is_paused(),
            speed_bps: self.ctx.bps.rate(),
            bandwidth_limit: self.ctx.bps.limit(),
            cache_bytes: self.ctx.cache.in_memory_bytes(),
        }
    }

    /// Most recent history records first
    pub async fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.ctx.history.recent(limit).await
    }

    /// Article statistics per configured server name
    pub fn server_stats(&self) -> Vec<(String, crate::bpsmeter::ServerStats)> {
        self.ctx
            .config
            .servers
            .iter()
            .enumerate()
            .map(|(i, s)| {
                (
                    s.display_name().to_string(),
                    self.ctx.bps.server_stats(ServerId(i as u16)),
                )
            })
            .collect()
    }

    /// Lift a server block (timed or permanent) by server name
    pub fn unblock_server(&self, name: &str) -> Result<()> {
        let index = self
            .ctx
            .config
            .servers
            .iter()
            .position(|s| s.display_name() == name || s.host == name)
            .ok_or_else(|| Error::NotFound(format!("server {name}")))?;
        info!(server = name, "unblocking server");
        self.ctx
            .command(Command::UnblockServer(ServerId(index as u16)));
        Ok(())
    }

    /// Timed callbacks that have not fired yet
    pub fn scheduled(&self) -> Vec<ScheduledTask> {
        self.ctx.scheduler.pending()
    }

    /// Write the snapshot of one queued job now
    pub async fn save_job(&self, id: JobId) -> Result<()> {
        let job = self
            .ctx
            .queue
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Download(DownloadError::NotFound { id: id.to_string() }))?;
        persistence::save_job(&job).await
    }
}
