//! The job queue
//!
//! [`NzbQueue`] keeps jobs in download order and hands articles to servers.
//! It lives behind the engine's queue lock; every subsystem that touches
//! jobs, files or articles does so through it while holding that lock.
//!
//! Ordering: higher priority first, and within one priority the job added
//! first. `Force` jobs keep downloading while the downloader is paused.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DownloadConfig;
use crate::error::{DownloadError, Error, Result};
use crate::job::{Article, NzbObject, Registered};
use crate::server::ServerInfo;
use crate::trylist::TryList;
use crate::types::{ArticleRef, FileId, JobId, JobSummary, Priority, ServerId, Status};

/// A file whose article table must be read from the admin directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingImport {
    /// Owning job
    pub job: JobId,
    /// File waiting for its table
    pub file: FileId,
    /// Location of the table
    pub path: PathBuf,
}

/// Ordered list of jobs plus the queue-level try-list
#[derive(Debug, Default)]
pub struct NzbQueue {
    jobs: Vec<NzbObject>,
    try_list: TryList,
    servers: Vec<ServerInfo>,
    top_only: bool,
    propagation_delay: Duration,
    imports: BTreeSet<(JobId, FileId)>,
    requested_imports: Vec<PendingImport>,
}

impl NzbQueue {
    /// Empty queue using the ordering options of `config`
    pub fn new(config: &DownloadConfig) -> Self {
        Self {
            top_only: config.top_only,
            propagation_delay: Duration::from_secs(config.propagation_delay * 60),
            ..Default::default()
        }
    }

    /// Replace the server views, keeping them sorted by priority
    pub fn set_servers(&mut self, mut servers: Vec<ServerInfo>) {
        servers.sort_by_key(|s| (s.priority, s.id));
        self.servers = servers;
        self.reset_all_try_lists();
    }

    /// Server views, best priority first
    pub fn servers(&self) -> &[ServerInfo] {
        &self.servers
    }

    /// Flip a server's active flag
    ///
    /// Activating a server clears every try-list so it gets a chance at all
    /// pending articles.
    pub fn set_server_active(&mut self, server: ServerId, active: bool) {
        let Some(info) = self.servers.iter_mut().find(|s| s.id == server) else {
            return;
        };
        if info.active == active {
            return;
        }
        info.active = active;
        if active {
            self.reset_all_try_lists();
        } else {
            // articles reserved for this server may now go elsewhere
            self.try_list.reset();
            for job in &mut self.jobs {
                job.reset_try_list();
            }
        }
    }

    /// Position a job of `priority` would be inserted at
    fn insert_position(&self, priority: Priority) -> usize {
        self.jobs
            .iter()
            .position(|j| j.priority < priority)
            .unwrap_or(self.jobs.len())
    }

    /// Insert a job according to its priority; returns its position
    pub fn add(&mut self, job: NzbObject) -> usize {
        let position = self.insert_position(job.priority);
        info!(job_id = %job.id, name = %job.name, position, priority = ?job.priority, "job queued");
        self.jobs.insert(position, job);
        self.try_list.reset();
        position
    }

    /// Remove a job and cancel its in-flight work
    pub fn remove(&mut self, id: JobId) -> Option<NzbObject> {
        let job = self.take(id)?;
        job.cancel.cancel();
        info!(job_id = %id, "job removed from queue");
        Some(job)
    }

    /// Take a job out of the queue without cancelling it (hand-off to
    /// post-processing)
    pub fn take(&mut self, id: JobId) -> Option<NzbObject> {
        let pos = self.jobs.iter().position(|j| j.id == id)?;
        self.imports.retain(|(job, _)| *job != id);
        self.requested_imports.retain(|p| p.job != id);
        Some(self.jobs.remove(pos))
    }

    /// Job by id
    pub fn get(&self, id: JobId) -> Option<&NzbObject> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Mutable job by id
    pub fn get_mut(&mut self, id: JobId) -> Option<&mut NzbObject> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn get_or_err(&mut self, id: JobId) -> Result<&mut NzbObject> {
        self.get_mut(id).ok_or_else(|| {
            Error::Download(DownloadError::NotFound { id: id.to_string() })
        })
    }

    /// Jobs in queue order
    pub fn jobs(&self) -> &[NzbObject] {
        &self.jobs
    }

    /// Number of jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Job ids in queue order
    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.id).collect()
    }

    /// Summaries in queue order
    pub fn summaries(&self) -> Vec<JobSummary> {
        self.jobs.iter().map(NzbObject::summary).collect()
    }

    /// Move a job to `index` (clamped); returns the new position
    ///
    /// The job's priority is not changed, so a later priority change may
    /// move it again.
    pub fn move_job(&mut self, id: JobId, index: usize) -> Result<usize> {
        let pos = self
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| Error::Download(DownloadError::NotFound { id: id.to_string() }))?;
        let job = self.jobs.remove(pos);
        let index = index.min(self.jobs.len());
        self.jobs.insert(index, job);
        self.try_list.reset();
        Ok(index)
    }

    /// Change a job's priority and re-sort it; returns the new position
    pub fn set_priority(&mut self, id: JobId, priority: Priority) -> Result<usize> {
        let Some((queue_priority, pause)) = priority.resolve_on_add() else {
            return Err(Error::Download(DownloadError::InvalidState {
                id: id.to_string(),
                operation: "set priority stop on".into(),
                current_state: "queued".into(),
            }));
        };
        let pos = self
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| Error::Download(DownloadError::NotFound { id: id.to_string() }))?;
        let mut job = self.jobs.remove(pos);
        job.priority = queue_priority;
        if pause {
            job.set_status(Status::Paused)?;
        }
        let position = self.insert_position(queue_priority);
        self.jobs.insert(position, job);
        self.try_list.reset();
        Ok(position)
    }

    /// Pause one job
    pub fn pause_job(&mut self, id: JobId) -> Result<()> {
        self.get_or_err(id)?.set_status(Status::Paused)
    }

    /// Resume one paused job
    pub fn resume_job(&mut self, id: JobId) -> Result<()> {
        let job = self.get_or_err(id)?;
        if job.status == Status::Paused {
            job.set_status(Status::Queued)?;
            job.reset_all_try_lists();
        }
        self.try_list.reset();
        Ok(())
    }

    /// Whether any job could hand out articles
    pub fn has_work(&self, force_only: bool) -> bool {
        self.jobs
            .iter()
            .any(|j| j.is_downloadable() && (!force_only || j.priority == Priority::Force))
    }

    /// Whether `job` was posted before `now - retention`
    pub fn job_older_than(&self, job: JobId, retention: Duration) -> bool {
        self.get(job)
            .is_some_and(|j| j.older_than(retention, Utc::now()))
    }

    /// Hand out up to `limit` articles to `server`
    ///
    /// Jobs are walked in queue order, skipping paused jobs and jobs still
    /// in their propagation delay. When nothing is found the server joins the
    /// queue try-list, so later calls return at once until the queue changes.
    pub fn get_articles(
        &mut self,
        server: ServerId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<ArticleRef> {
        self.get_articles_filtered(server, limit, now, false)
    }

    /// [`get_articles`](Self::get_articles) restricted to `Force` jobs when
    /// `force_only` is set (the downloader is paused)
    pub fn get_articles_filtered(
        &mut self,
        server: ServerId,
        limit: usize,
        now: DateTime<Utc>,
        force_only: bool,
    ) -> Vec<ArticleRef> {
        let mut out = Vec::new();
        if self.try_list.contains(server) {
            return out;
        }
        let Some(info) = self.servers.iter().find(|s| s.id == server).copied() else {
            return out;
        };
        if !info.active {
            return out;
        }

        let mut delayed = false;
        for job in &mut self.jobs {
            if !job.is_downloadable() || (force_only && job.priority != Priority::Force) {
                continue;
            }
            if job.in_propagation_delay(self.propagation_delay, now) {
                delayed = true;
                if self.top_only {
                    break;
                }
                continue;
            }

            for &file_id in &job.active {
                if let Some(file) = job.file(file_id)
                    && !file.import_finished
                    && self.imports.insert((job.id, file_id))
                {
                    self.requested_imports.push(PendingImport {
                        job: job.id,
                        file: file_id,
                        path: job.admin_path.join(file_id.table_name()),
                    });
                }
            }

            if !job.try_list().contains(server) {
                job.get_articles(&info, &self.servers, limit - out.len(), &mut out);
            }
            if out.len() >= limit || self.top_only {
                break;
            }
        }

        if out.is_empty() && !delayed && self.requested_imports.is_empty() {
            self.try_list.add(server);
        }
        if !out.is_empty() {
            debug!(server = %server, count = out.len(), "handed out articles");
        }
        out
    }

    /// Files whose article tables should be loaded now
    pub fn take_imports(&mut self) -> Vec<PendingImport> {
        std::mem::take(&mut self.requested_imports)
    }

    /// Install a loaded article table
    pub fn install_articles(&mut self, job: JobId, file: FileId, table: Vec<Article>) {
        self.imports.remove(&(job, file));
        let Some(nzo) = self.get_mut(job) else {
            return;
        };
        if let Some(nzf) = nzo.file_mut(file) {
            nzf.install_articles(table);
            nzf.reset_all_try_lists();
        }
        nzo.reset_try_list();
        self.try_list.reset();
    }

    /// A table could not be read; let the file be requested again later
    pub fn import_failed(&mut self, job: JobId, file: FileId) {
        self.imports.remove(&(job, file));
    }

    /// Article by handle
    pub fn article(&self, article: ArticleRef) -> Option<&Article> {
        self.get(article.job)?.file(article.file)?.article(article.index)
    }

    /// Fail-over after `fetcher` could not supply `article`
    ///
    /// Returns `true` when another server will try it.
    pub fn search_new_server(&mut self, article: ArticleRef, fetcher: ServerId) -> bool {
        let Some(pos) = self.jobs.iter().position(|j| j.id == article.job) else {
            return false;
        };
        let found = self.jobs[pos].search_new_server(article, fetcher, &self.servers);
        if found {
            self.try_list.reset();
        }
        found
    }

    /// Give an article back after a connection failure
    pub fn reset_article(&mut self, article: ArticleRef, exhausted: bool) {
        if let Some(job) = self.get_mut(article.job) {
            job.reset_article(article, exhausted);
        }
        self.try_list.reset();
    }

    /// Record an article outcome on its job
    pub fn register_article(
        &mut self,
        article: ArticleRef,
        success: bool,
        config: &DownloadConfig,
    ) -> Option<Registered> {
        let job = self.get_mut(article.job)?;
        let registered = job.register_article(article, success, config);
        if registered.promoted_blocks > 0 {
            self.try_list.reset();
        }
        Some(registered)
    }

    /// Release every article claimed by `server`
    pub fn release_server(&mut self, server: ServerId) {
        for job in &mut self.jobs {
            job.release_server(server);
        }
        self.try_list.reset();
    }

    /// Clear the queue try-list
    pub fn reset_try_list(&mut self) {
        self.try_list.reset();
    }

    /// Clear try-lists at every level
    pub fn reset_all_try_lists(&mut self) {
        self.try_list.reset();
        for job in &mut self.jobs {
            job.reset_all_try_lists();
        }
    }

    /// Queue try-list
    pub fn try_list(&self) -> &TryList {
        &self.try_list
    }
}
