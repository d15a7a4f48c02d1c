//! Adding jobs to the queue and re-queuing failed ones

use std::borrow::Cow;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use chrono::Utc;
use flate2::read::GzDecoder;
use tracing::{info, warn};

use super::{Context, Engine};
use crate::error::{DownloadError, Error, Result};
use crate::job::NzbObject;
use crate::nzb::{ParsedNzb, parse_nzb, strip_nzb_extension};
use crate::persistence::{self, ADMIN_DIR};
use crate::types::{Event, HistoryEntry, JobId, JobOptions, Priority, Stage, Status};

impl Engine {
    /// Add an NZB held in memory
    ///
    /// `name` is the NZB filename; the job name (and a `{{password}}` in it)
    /// is derived from it. Gzip-compressed input is accepted.
    ///
    /// A malformed NZB is recorded in history as failed and returned as
    /// [`Error::InvalidNzb`]. A job added with [`crate::Priority::Stop`] goes
    /// straight to history; its id is still returned so it can be retried.
    pub async fn add_nzb_content(
        &self,
        data: &[u8],
        name: &str,
        options: JobOptions,
    ) -> Result<JobId> {
        add_nzb(&self.ctx, data, name, options).await
    }

    /// Add an NZB file from disk
    pub async fn add_nzb_file(&self, path: &Path, options: JobOptions) -> Result<JobId> {
        let data = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("NZB file {} does not exist", path.display()))
            }
            _ => Error::Io(e),
        })?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed.nzb");
        self.add_nzb_content(&data, name, options).await
    }

    /// Queue a finished (usually failed) job again from its admin directory
    ///
    /// `path` is the job's admin directory or the job directory holding it.
    /// The job is rebuilt from the NZB backup and `__ATTRIB__`; files renamed
    /// during the first run keep their new names.
    pub async fn retry_job(&self, path: &Path) -> Result<JobId> {
        if !self.ctx.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let admin = if path.ends_with(ADMIN_DIR) {
            path.to_path_buf()
        } else {
            path.join(ADMIN_DIR)
        };
        let backup = persistence::find_nzb_backup(&admin).await.ok_or_else(|| {
            Error::NotFound(format!("no NZB backup in {}", admin.display()))
        })?;
        let data = tokio::fs::read(&backup).await?;
        let data = decompress(&data)?;
        let parsed = parse_nzb(&data)?;
        let attributes = persistence::load_attributes(&admin).await?;
        let nzb_name = backup
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.trim_end_matches(".gz").to_string())
            .unwrap_or_else(|| format!("{}.nzb", attributes.name));

        let options = attributes.to_options();
        let (priority, paused) = options
            .priority
            .resolve_on_add()
            .unwrap_or((Priority::Normal, false));
        let options = JobOptions { priority, ..options };
        let mut job = NzbObject::from_parsed(parsed, &nzb_name, &options, paused, &self.ctx.config)?;

        let download_path = admin
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.ctx.config.download_dir().join(&attributes.name));
        if let Some(queued) = self
            .ctx
            .queue
            .lock()
            .await
            .jobs()
            .iter()
            .find(|j| j.download_path == download_path)
        {
            return Err(Error::Download(DownloadError::InvalidState {
                id: queued.id.to_string(),
                operation: "retry".into(),
                current_state: queued.status.to_string(),
            }));
        }
        job.name = attributes.name;
        job.admin_path = admin.clone();
        job.download_path = download_path;
        job.renames = persistence::load_renames(&admin).await?;
        job.verified = persistence::load_verified(&admin).await?;
        apply_renames(&mut job);

        info!(job_id = %job.id, name = %job.name, "retrying job");
        queue_job(&self.ctx, job).await
    }
}

/// Parse, back up and queue one NZB
pub(super) async fn add_nzb(
    ctx: &Context,
    data: &[u8],
    nzb_name: &str,
    options: JobOptions,
) -> Result<JobId> {
    if !ctx.accepting.load(Ordering::SeqCst) {
        return Err(Error::ShuttingDown);
    }
    let data = match decompress(data) {
        Ok(data) => data,
        Err(e) => return Err(reject(ctx, nzb_name, &options, e).await),
    };
    let parsed: ParsedNzb = match parse_nzb(&data) {
        Ok(parsed) => parsed,
        Err(e) => return Err(reject(ctx, nzb_name, &options, e).await),
    };

    let resolved = options.priority.resolve_on_add();
    let (priority, paused) = resolved.unwrap_or((Priority::Normal, false));
    let job_options = JobOptions {
        priority,
        ..options.clone()
    };
    let mut job = match NzbObject::from_parsed(parsed, nzb_name, &job_options, paused, &ctx.config)
    {
        Ok(job) => job,
        Err(e) => return Err(reject(ctx, nzb_name, &options, e).await),
    };

    let taken: Vec<PathBuf> = ctx
        .queue
        .lock()
        .await
        .jobs()
        .iter()
        .map(|j| j.download_path.clone())
        .collect();
    job.download_path = unique_job_dir(&job.download_path, &taken);
    job.admin_path = job.download_path.join(ADMIN_DIR);

    persistence::save_nzb_backup(&job.admin_path, nzb_name, &data).await?;

    if resolved.is_none() {
        let id = job.id;
        persistence::save_job(&job).await?;
        job.fail("stopped on add");
        ctx.record_history(job.history_entry(Some(&job.download_path)))
            .await;
        ctx.emit(Event::Failed {
            id,
            stage: Stage::Download,
            error: "stopped on add".into(),
        });
        ctx.persist_queue().await;
        return Ok(id);
    }

    queue_job(ctx, job).await
}

/// Snapshot a job, unload its article tables and put it in the queue
async fn queue_job(ctx: &Context, mut job: NzbObject) -> Result<JobId> {
    persistence::save_job(&job).await?;
    for file in &mut job.files {
        file.unload_articles();
    }
    let (id, name) = (job.id, job.name.clone());
    ctx.queue.lock().await.add(job);
    ctx.emit(Event::Queued { id, name });
    ctx.notify_queue();
    ctx.persist_queue().await;
    Ok(id)
}

/// Record an NZB that could not become a job
async fn reject(ctx: &Context, nzb_name: &str, options: &JobOptions, error: Error) -> Error {
    let id = JobId::generate();
    let name = strip_nzb_extension(nzb_name).to_string();
    warn!(job_id = %id, nzb = nzb_name, error = %error, "nzb rejected");
    ctx.record_history(HistoryEntry {
        id: 0,
        job_id: id,
        name,
        category: options.category.clone(),
        destination: None,
        status: Status::Failed,
        fail_message: Some(error.to_string()),
        size_bytes: 0,
        download_time: std::time::Duration::ZERO,
        completed_at: Utc::now(),
    })
    .await;
    ctx.emit(Event::Failed {
        id,
        stage: Stage::Download,
        error: error.to_string(),
    });
    error
}

/// Undo gzip compression, if any
fn decompress(data: &[u8]) -> Result<Cow<'_, [u8]>> {
    if data.len() < 2 || data[0] != 0x1f || data[1] != 0x8b {
        return Ok(Cow::Borrowed(data));
    }
    let mut plain = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data)
        .read_to_end(&mut plain)
        .map_err(|e| Error::InvalidNzb(format!("corrupt gzip data: {e}")))?;
    Ok(Cow::Owned(plain))
}

/// `path`, or `path.1`, `path.2`... when it exists or another job uses it
fn unique_job_dir(path: &Path, taken: &[PathBuf]) -> PathBuf {
    let in_use = |p: &Path| p.exists() || taken.iter().any(|t| t == p);
    if !in_use(path) {
        return path.to_path_buf();
    }
    let mut n = 1u32;
    loop {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        let candidate = PathBuf::from(name);
        if !in_use(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Give files their names from the previous run
///
/// `renames` maps the current name to the name in the NZB.
fn apply_renames(job: &mut NzbObject) {
    for (current, original) in &job.renames {
        if let Some(file) = job.files.iter_mut().find(|f| &f.filename == original) {
            file.filename = current.clone();
            file.classify_par2();
        }
    }
}
