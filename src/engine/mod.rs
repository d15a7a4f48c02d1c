//! The root context
//!
//! [`Context`] owns every subsystem of a running engine: the queue, the
//! article cache, the meter, the scheduler, the direct unpacker and the
//! channels between the pipeline tasks. It is created once and handed to
//! each task as an `Arc`. [`Engine`] is the public handle around it.
//!
//! ```text
//!  downloader ──DecodeRequest──▶ decoder workers ──AssembleRequest──▶ assembler
//!      ▲                                                                 │
//!      └──── Command (pause, reactivate, forget job) ◀── scheduler       │
//!                                                                         ▼
//!                                                   post-processor ◀── NzbObject
//! ```

mod control;
mod lifecycle;
mod nzb;

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assembler::AssembleRequest;
use crate::bpsmeter::BpsMeter;
use crate::cache::ArticleCache;
use crate::config::Config;
use crate::db::{Database, HistoryRecorder};
use crate::decoder::DecodeRequest;
use crate::directunpack::DirectUnpacker;
use crate::downloader::{self, Command};
use crate::error::Result;
use crate::job::NzbObject;
use crate::par2::{CliParityHandler, NoOpParityHandler, ParityHandler};
use crate::persistence::{self, JobRef, QueueFile};
use crate::queue::NzbQueue;
use crate::scheduler::Scheduler;
use crate::types::{ArticleRef, Event, HistoryEntry, JobId, Stage};

/// Requests the decoder workers may have outstanding before the downloader waits
const DECODER_QUEUE: usize = 64;

/// History records kept in `queue.sab`
const RECENT_HISTORY: usize = 50;

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 1000;

/// Shared state of one engine
pub(crate) struct Context {
    pub(crate) config: Arc<Config>,
    pub(crate) queue: tokio::sync::Mutex<NzbQueue>,
    pub(crate) cache: ArticleCache,
    pub(crate) bps: BpsMeter,
    pub(crate) events: broadcast::Sender<Event>,
    /// Signalled after every queue mutation the downloader should see
    pub(crate) queue_changed: Notify,
    /// Signalled when files whose write failed should be assembled again
    pub(crate) assembly_retry: Notify,
    pub(crate) decoder_tx: mpsc::Sender<DecodeRequest>,
    pub(crate) assembler_tx: mpsc::UnboundedSender<AssembleRequest>,
    pub(crate) downloader_tx: mpsc::UnboundedSender<Command>,
    pub(crate) postproc_tx: mpsc::UnboundedSender<NzbObject>,
    pub(crate) direct_unpack: DirectUnpacker,
    pub(crate) scheduler: Scheduler,
    pub(crate) shutdown: CancellationToken,
    /// Downloader paused (by the user or after a full disk)
    pub(crate) paused: AtomicBool,
    /// New jobs are refused once shutdown started
    pub(crate) accepting: AtomicBool,
    /// Jobs handed to the post-processor and not finished yet
    pub(crate) post_processing: Mutex<Vec<JobRef>>,
    pub(crate) history: Arc<dyn HistoryRecorder>,
    pub(crate) recent_history: Mutex<VecDeque<HistoryEntry>>,
    pub(crate) parity: Arc<dyn ParityHandler>,
    save_lock: tokio::sync::Mutex<()>,
}

/// Receiving ends of the pipeline channels, consumed by [`Engine::start`]
pub(crate) struct Receivers {
    pub(crate) decoder: mpsc::Receiver<DecodeRequest>,
    pub(crate) assembler: mpsc::UnboundedReceiver<AssembleRequest>,
    pub(crate) downloader: mpsc::UnboundedReceiver<Command>,
    pub(crate) postproc: mpsc::UnboundedReceiver<NzbObject>,
}

impl Context {
    pub(crate) fn new(
        config: Arc<Config>,
        history: Arc<dyn HistoryRecorder>,
        parity: Arc<dyn ParityHandler>,
    ) -> (Arc<Self>, Receivers) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (decoder_tx, decoder) = mpsc::channel(DECODER_QUEUE);
        let (assembler_tx, assembler) = mpsc::unbounded_channel();
        let (downloader_tx, downloader) = mpsc::unbounded_channel();
        let (postproc_tx, postproc) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let mut queue = NzbQueue::new(&config.download);
        queue.set_servers(downloader::server_views(&config));

        let ctx = Self {
            cache: ArticleCache::new(config.download.cache_limit),
            bps: BpsMeter::new(config.bandwidth_limit()),
            direct_unpack: DirectUnpacker::new(&config, events.clone(), shutdown.clone()),
            scheduler: Scheduler::new(downloader_tx.clone(), shutdown.clone()),
            queue: tokio::sync::Mutex::new(queue),
            events,
            queue_changed: Notify::new(),
            assembly_retry: Notify::new(),
            decoder_tx,
            assembler_tx,
            downloader_tx,
            postproc_tx,
            shutdown,
            paused: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            post_processing: Mutex::new(Vec::new()),
            history,
            recent_history: Mutex::new(VecDeque::new()),
            parity,
            save_lock: tokio::sync::Mutex::new(()),
            config,
        };
        let receivers = Receivers {
            decoder,
            assembler,
            downloader,
            postproc,
        };
        (Arc::new(ctx), receivers)
    }

    /// Broadcast an event; nobody listening is fine
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Wake the downloader
    pub(crate) fn notify_queue(&self) {
        self.queue_changed.notify_one();
    }

    /// Send a command to the downloader loop
    pub(crate) fn command(&self, command: Command) {
        if self.downloader_tx.send(command).is_err() {
            debug!("downloader channel closed");
        }
    }

    /// Ask the assembler to write out what is cached for the article's file
    pub(crate) fn assemble(&self, article: ArticleRef) {
        let request = AssembleRequest {
            job: article.job,
            file: article.file,
        };
        if self.assembler_tx.send(request).is_err() {
            debug!(%article, "assembler channel closed");
        }
    }

    /// Let the assembler retry files whose write failed
    pub(crate) fn retry_assembly(&self) {
        self.assembly_retry.notify_one();
    }

    /// Hand a job that left the queue to the post-processor
    pub(crate) fn post_process(&self, job: NzbObject) {
        self.post_processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job_ref(&job));
        let id = job.id;
        if self.postproc_tx.send(job).is_err() {
            warn!(job_id = %id, "post-processor is gone, job stays in the queue file");
        }
    }

    /// The post-processor is done with a job
    pub(crate) fn post_processed(&self, id: JobId) {
        self.post_processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| r.id != id);
    }

    /// Fail a queued job and send it to post-processing
    ///
    /// Called with the queue locked. The admin directory is kept so the job
    /// can be retried.
    pub(crate) fn fail_job(&self, queue: &mut NzbQueue, id: JobId, reason: String) {
        let Some(mut job) = queue.take(id) else {
            return;
        };
        job.fail(reason.clone());
        self.cache.purge_job(id);
        self.command(Command::ForgetJob(id));
        self.emit(Event::Failed {
            id,
            stage: Stage::Download,
            error: reason,
        });
        self.post_process(job);
    }

    /// A write hit a full disk: stop downloading and tell the user
    pub(crate) fn report_disk_full(&self, message: &str) {
        warn!(error = message, "disk full, pausing the downloader");
        self.command(Command::Pause);
        self.emit(Event::Warning {
            message: format!("download paused: {message}"),
        });
    }

    /// Store a history record and keep it for `queue.sab`
    pub(crate) async fn record_history(&self, entry: HistoryEntry) {
        if let Err(e) = self.history.record(&entry).await {
            warn!(job_id = %entry.job_id, error = %e, "failed to record history");
        }
        let mut recent = self
            .recent_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        recent.push_front(entry);
        recent.truncate(RECENT_HISTORY);
    }

    /// Write `queue.sab`
    pub(crate) async fn save_queue(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let jobs: Vec<JobRef> = self.queue.lock().await.jobs().iter().map(job_ref).collect();
        let postproc = self
            .post_processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let history = self
            .recent_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        persistence::save_queue(
            self.config.admin_dir(),
            &QueueFile::new(jobs, postproc, history),
        )
        .await
    }

    /// Write `queue.sab`, logging a failure
    pub(crate) async fn persist_queue(&self) {
        if let Err(e) = self.save_queue().await {
            if e.is_disk_full() {
                self.report_disk_full(&e.to_string());
            } else {
                warn!(error = %e, "failed to save the queue");
            }
        }
    }
}

/// Where the snapshot of `job` lives, relative to the incomplete root
pub(crate) fn job_ref(job: &NzbObject) -> JobRef {
    JobRef {
        id: job.id,
        folder: job
            .download_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.name.clone()),
    }
}

/// Pick the par2 implementation from the tool settings
fn select_parity_handler(config: &Config) -> Arc<dyn ParityHandler> {
    let handler: Arc<dyn ParityHandler> = if let Some(path) = &config.tools.par2_path {
        Arc::new(CliParityHandler::new(path.clone()))
    } else if config.tools.search_path {
        match CliParityHandler::from_path() {
            Some(handler) => Arc::new(handler),
            None => Arc::new(NoOpParityHandler),
        }
    } else {
        Arc::new(NoOpParityHandler)
    };
    info!(
        parity_handler = handler.name(),
        can_repair = handler.can_repair(),
        "parity handler selected"
    );
    handler
}

/// A Usenet download engine
///
/// Create it with [`Engine::new`], start the pipeline with
/// [`Engine::start`] and stop it with [`Engine::shutdown`]. Everything that
/// happens is broadcast as an [`Event`] to [`Engine::subscribe`]rs.
pub struct Engine {
    ctx: Arc<Context>,
    receivers: Mutex<Option<Receivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Validate `config`, open the history store and restore the saved queue
    ///
    /// Fails with [`crate::Error::QueueVersion`] when `queue.sab` was written
    /// by an incompatible version.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        for dir in [config.download_dir(), config.complete_dir(), config.admin_dir()] {
            tokio::fs::create_dir_all(dir).await?;
        }
        let db = Database::new(&config.persistence.database_path).await?;
        let parity = select_parity_handler(&config);
        let (ctx, receivers) = Context::new(Arc::new(config), Arc::new(db), parity);
        lifecycle::restore(&ctx).await?;
        info!(
            servers = ctx.config.servers.len(),
            jobs = ctx.queue.lock().await.len(),
            "engine created"
        );
        Ok(Self {
            ctx,
            receivers: Mutex::new(Some(receivers)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to engine events
    ///
    /// Slow subscribers lose the oldest events (`RecvError::Lagged`).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.ctx.events.subscribe()
    }

    /// The active configuration
    pub fn config(&self) -> &Config {
        &self.ctx.config
    }
}

#[cfg(test)]
pub(crate) fn test_context(config: Config) -> (Arc<Context>, Receivers) {
    test_context_with(config, Arc::new(NoOpParityHandler))
}

#[cfg(test)]
pub(crate) fn test_context_with(
    config: Config,
    parity: Arc<dyn ParityHandler>,
) -> (Arc<Context>, Receivers) {
    Context::new(
        Arc::new(config),
        Arc::new(crate::db::MemoryHistory::new()),
        parity,
    )
}
