//! Post-processing of jobs that left the download queue
//!
//! One worker takes jobs from two queues: `fast` holds jobs whose RAR sets
//! were (at least partly) extracted by the direct unpacker, `slow` holds the
//! rest. Up to three fast jobs are taken before one slow job, so a long
//! repair cannot hold up finished downloads and slow jobs still get a turn.
//!
//! Stages, in order:
//!
//! 1. PAR2 verify and repair (a set short of blocks sends the job back to
//!    the queue with more par2 volumes)
//! 2. join of split files, RAR extraction, 7z and zip extraction, join of
//!    split transport streams
//! 3. SFV check (only when there was no par2 set)
//! 4. sample and marker file removal, recursive unpack of nested archives
//! 5. user script
//! 6. move to `<complete>/<category>/<name>`
//!
//! A failing stage fails the job when `safe_postproc` is set; otherwise a
//! warning is emitted and the job continues. Failed jobs keep their admin
//! directory so they can be retried.

mod cleanup;
mod extract;
mod join;
mod mover;
mod repair;
mod script;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Context;
use crate::error::{Error, PostProcessError};
use crate::job::NzbObject;
use crate::persistence;
use crate::types::{Event, Priority, Stage, Status};

use extract::{Extractor, PasswordList};
use repair::Verdict;

/// Fast jobs taken in a row before a waiting slow job gets its turn
const FAST_BURST: usize = 3;

/// Start the post-processing worker
pub(crate) fn spawn(ctx: Arc<Context>, rx: mpsc::UnboundedReceiver<NzbObject>) -> JoinHandle<()> {
    tokio::spawn(run(ctx, rx))
}

#[derive(Default)]
struct Queues {
    fast: VecDeque<NzbObject>,
    slow: VecDeque<NzbObject>,
    fast_run: usize,
}

impl Queues {
    fn push(&mut self, job: NzbObject, fast: bool) {
        if fast {
            self.fast.push_back(job);
        } else {
            self.slow.push_back(job);
        }
    }

    fn next(&mut self) -> Option<NzbObject> {
        if (self.fast_run < FAST_BURST || self.slow.is_empty())
            && let Some(job) = self.fast.pop_front()
        {
            self.fast_run += 1;
            return Some(job);
        }
        self.fast_run = 0;
        self.slow.pop_front()
    }
}

async fn run(ctx: Arc<Context>, mut rx: mpsc::UnboundedReceiver<NzbObject>) {
    debug!("post-processor started");
    let mut queues = Queues::default();
    loop {
        while let Ok(job) = rx.try_recv() {
            let fast = ctx.direct_unpack.has_sets(job.id);
            queues.push(job, fast);
        }
        let job = match queues.next() {
            Some(job) => job,
            None => tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => {
                        let fast = ctx.direct_unpack.has_sets(job.id);
                        queues.push(job, fast);
                        continue;
                    }
                    None => break,
                },
                _ = ctx.shutdown.cancelled() => break,
            },
        };
        if ctx.shutdown.is_cancelled() {
            break;
        }
        process(&ctx, job).await;
    }
    debug!("post-processor stopped");
}

/// Run one job through the pipeline and record the result
async fn process(ctx: &Context, job: NzbObject) {
    if let Err(e) = persistence::save_job(&job).await {
        warn!(job_id = %job.id, error = %e, "failed to snapshot job before post-processing");
    }
    if job.status == Status::Failed {
        ctx.direct_unpack.cancel(job.id);
        ctx.direct_unpack.finish(job.id).await;
        finish(ctx, job, None).await;
        return;
    }

    info!(job_id = %job.id, name = %job.name, post_process = ?job.post_process, "post-processing started");
    let cancel = ctx.shutdown.child_token();
    let mut pipeline = Pipeline {
        ctx,
        job,
        cancel,
        failed_stage: None,
        par2_checked: false,
    };
    match pipeline.run().await {
        Flow::Finished(destination) => finish(ctx, pipeline.job, destination).await,
        Flow::NeedBlocks { setname, blocks } => requeue(ctx, pipeline.job, &setname, blocks).await,
        Flow::Interrupted => {
            info!(job_id = %pipeline.job.id, "post-processing interrupted, it restarts with the engine");
        }
    }
}

enum Flow {
    Finished(Option<PathBuf>),
    NeedBlocks { setname: String, blocks: u32 },
    Interrupted,
}

struct Pipeline<'a> {
    ctx: &'a Context,
    job: NzbObject,
    cancel: CancellationToken,
    failed_stage: Option<Stage>,
    par2_checked: bool,
}

impl Pipeline<'_> {
    async fn run(&mut self) -> Flow {
        let config = Arc::clone(&self.ctx.config);
        let id = self.job.id;
        let download_path = self.job.download_path.clone();

        if self.job.post_process.repair() {
            self.set_status(Status::Verifying);
            match repair::verify_and_repair(self.ctx, &mut self.job, &self.cancel).await {
                Ok(Verdict::Intact) => {}
                Ok(Verdict::NeedBlocks { setname, blocks }) => {
                    return Flow::NeedBlocks { setname, blocks };
                }
                Err(e) => {
                    if self.stage_failed(Stage::Repair, e) {
                        return self.stop();
                    }
                }
            }
            self.par2_checked = !self.job.verified.is_empty();
        }

        let direct = self.ctx.direct_unpack.finish(id).await;
        self.job.direct_unpacked.extend(direct);
        if self.interrupted() {
            return Flow::Interrupted;
        }

        let mut sources: Vec<PathBuf> = Vec::new();
        if self.job.post_process.unpack() {
            self.set_status(Status::Extracting);

            match join::join_split_files(&download_path).await {
                Ok(parts) => sources.extend(parts),
                Err(e) => {
                    if self.stage_failed(Stage::Join, e) {
                        return self.stop();
                    }
                }
            }

            let unrar = config
                .tools
                .resolve_binary(config.tools.unrar_path.as_ref(), &["unrar", "rar"]);
            let passwords = PasswordList::collect(
                self.job.password.as_deref(),
                config.tools.password_file.as_deref(),
            )
            .await;
            let extractor = Extractor {
                unrar: unrar.as_deref(),
                passwords: &passwords,
                cancel: &self.cancel,
            };
            let ctx = self.ctx;
            let result = extract::unpack(
                &extractor,
                &download_path,
                &self.job.direct_unpacked,
                config.processing.extraction.max_recursion_depth,
                |archive| {
                    ctx.emit(Event::Extracting {
                        id,
                        archive: archive.to_string(),
                    })
                },
            )
            .await;
            match result {
                Ok(unpacked) => {
                    if unpacked.count > 0 {
                        info!(job_id = %id, archives = unpacked.count, "archives extracted");
                    }
                    sources.extend(unpacked.sources);
                }
                Err(e) => {
                    if self.interrupted() {
                        return Flow::Interrupted;
                    }
                    if self.stage_failed(Stage::Extract, e) {
                        return self.stop();
                    }
                }
            }
            for setname in &self.job.direct_unpacked {
                if let Ok(volumes) = extract::rar_set_volumes(&download_path, setname).await {
                    sources.extend(volumes);
                }
            }

            match join::join_ts_files(&download_path).await {
                Ok(parts) => sources.extend(parts),
                Err(e) => {
                    if self.stage_failed(Stage::Join, e) {
                        return self.stop();
                    }
                }
            }
        }

        if !self.par2_checked
            && let Err(e) = join::check_sfv(&download_path).await
            && self.stage_failed(Stage::Sfv, e)
        {
            return self.stop();
        }

        if self.job.post_process.delete() && self.failed_stage.is_none() {
            cleanup::remove_files(&sources).await;
            if config.processing.enable_par_cleanup && self.par2_checked {
                let par2: Vec<PathBuf> = self
                    .job
                    .files
                    .iter()
                    .filter(|f| f.is_par2)
                    .map(|f| download_path.join(&f.filename))
                    .collect();
                cleanup::remove_files(&par2).await;
            }
        }
        let cleanup_config = &config.processing.cleanup;
        if cleanup_config.enabled {
            if cleanup_config.delete_samples {
                cleanup::remove_samples(&download_path).await;
            }
            cleanup::remove_markers(&download_path, cleanup_config).await;
        }
        if self.interrupted() {
            return Flow::Interrupted;
        }

        let script = self
            .job
            .script
            .clone()
            .or_else(|| config.processing.script.clone());
        if let Some(script) = script {
            let status = match self.failed_stage {
                None => 0,
                Some(Stage::Repair) => 1,
                Some(_) => 2,
            };
            if let Err(e) = script::run_script(&script, &self.job, &download_path, status, &self.cancel).await {
                if self.interrupted() {
                    return Flow::Interrupted;
                }
                if config.processing.script_can_fail {
                    self.stage_failed(Stage::Script, e);
                    return self.stop();
                }
                warn!(job_id = %id, error = %e, "user script failed");
            }
        }

        let mut destination = config.complete_dir().clone();
        if let Some(category) = &self.job.category {
            destination.push(category);
        }
        destination.push(&self.job.name);
        self.set_status(Status::Moving);
        self.ctx.emit(Event::Moving {
            id,
            destination: destination.clone(),
        });
        match mover::move_output(&download_path, &destination, config.processing.file_collision).await {
            Ok(_) => Flow::Finished(Some(destination)),
            Err(e) => {
                // nothing left to skip after a failed move
                self.stage_failed(Stage::Move, e);
                self.force_fail();
                Flow::Finished(None)
            }
        }
    }

    fn set_status(&mut self, status: Status) {
        if self.job.status != status {
            self.job.status = status;
            self.ctx.emit(Event::StatusChanged {
                id: self.job.id,
                status,
            });
        }
    }

    fn interrupted(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    /// Record a stage failure; true when the job must stop here
    fn stage_failed(&mut self, stage: Stage, error: Error) -> bool {
        let safe = self.ctx.config.processing.safe_postproc;
        warn!(job_id = %self.job.id, stage = ?stage, error = %error, safe_postproc = safe, "post-processing stage failed");
        self.failed_stage.get_or_insert(stage);
        // data that cannot be repaired fails the job whatever safe_postproc says
        let unrepairable = matches!(
            error,
            Error::PostProcess(PostProcessError::RepairFailed { .. })
        );
        if safe || unrepairable || stage == Stage::Script {
            self.job.fail(error.to_string());
            self.ctx.emit(Event::Failed {
                id: self.job.id,
                stage,
                error: error.to_string(),
            });
            true
        } else {
            self.ctx.emit(Event::Warning {
                message: format!("{}: {error}", self.job.name),
            });
            false
        }
    }

    fn force_fail(&mut self) {
        if self.job.status != Status::Failed {
            let message = self
                .job
                .fail_message
                .clone()
                .unwrap_or_else(|| "moving the job output failed".into());
            self.job.fail(message.clone());
            self.ctx.emit(Event::Failed {
                id: self.job.id,
                stage: Stage::Move,
                error: message,
            });
        }
    }

    fn stop(&self) -> Flow {
        Flow::Finished(None)
    }
}

/// Send a job back to the queue to fetch more par2 volumes
async fn requeue(ctx: &Context, mut job: NzbObject, setname: &str, needed: u32) {
    let id = job.id;
    let blocks = job.get_extra_blocks(setname, needed);
    info!(job_id = %id, setname, needed, blocks, "fetching more par2 blocks");
    ctx.emit(Event::Par2Promoted {
        id,
        setname: setname.to_string(),
        blocks,
    });
    job.priority = Priority::Repair;
    job.status = Status::Queued;
    if let Err(e) = persistence::save_job(&job).await {
        warn!(job_id = %id, error = %e, "failed to snapshot re-queued job");
    }
    for file in &mut job.files {
        file.unload_articles();
    }
    ctx.queue.lock().await.add(job);
    ctx.emit(Event::StatusChanged {
        id,
        status: Status::Queued,
    });
    ctx.post_processed(id);
    ctx.notify_queue();
    ctx.persist_queue().await;
}

/// Record the outcome of a job and clean up after it
async fn finish(ctx: &Context, mut job: NzbObject, destination: Option<PathBuf>) {
    let id = job.id;
    if job.status == Status::Failed {
        // the job directory is where a retry finds the admin files
        ctx.record_history(job.history_entry(Some(&job.download_path)))
            .await;
        info!(job_id = %id, name = %job.name, reason = ?job.fail_message, "job finished as failed");
    } else {
        job.status = Status::Completed;
        let path = destination.unwrap_or_else(|| job.download_path.clone());
        ctx.record_history(job.history_entry(Some(&path))).await;
        if let Err(e) = persistence::purge_admin(&job.admin_path).await {
            warn!(job_id = %id, error = %e, "failed to remove admin directory");
        }
        if let Err(e) = tokio::fs::remove_dir_all(&job.download_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(job_id = %id, error = %e, "failed to remove job directory");
        }
        info!(job_id = %id, name = %job.name, path = %path.display(), "job complete");
        ctx.emit(Event::StatusChanged {
            id,
            status: Status::Completed,
        });
        ctx.emit(Event::Complete { id, path });
    }
    ctx.post_processed(id);
    ctx.persist_queue().await;
}
