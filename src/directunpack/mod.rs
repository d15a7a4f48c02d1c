//! Extraction of RAR sets while they download
//!
//! When the first volume of a set is on disk an `unrar x -vp` process is
//! started on it. `-vp` makes unrar stop after every volume with a
//! `[C]ontinue, [Q]uit` prompt; the prompt is answered with `C` once the
//! next volume has been assembled. A volume that fails its CRC check, or
//! that is still missing when the download ends, aborts the set: unrar gets
//! `Q`, the files it extracted so far are deleted and the post-processor
//! unpacks the set the normal way.
//!
//! Output goes to `<job dir>/extracted`. At most `direct_unpack_threads`
//! processes run at once; further sets wait for a slot.

mod volumes;

pub(crate) use volumes::{is_first_rar_volume, is_rar_file, rar_volume};

use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::process::Supervised;
use crate::types::{Event, JobId};

/// Directory inside the job directory that receives extracted files
pub(crate) const EXTRACT_DIR: &str = "extracted";

/// What the direct unpacker needs to know about a job
#[derive(Debug, Clone)]
pub(crate) struct UnpackJob {
    pub id: JobId,
    pub download_path: PathBuf,
    pub password: Option<String>,
    /// The job's post-processing includes unpacking
    pub unpack: bool,
}

#[derive(Debug, Default)]
struct SetState {
    /// Volumes on disk with a good CRC
    arrived: BTreeSet<u32>,
    /// No more volumes will arrive
    download_finished: bool,
    abort: CancellationToken,
    abort_reason: Option<String>,
    wake: Arc<Notify>,
    task: Option<JoinHandle<bool>>,
}

type SetKey = (JobId, String);

struct Inner {
    unrar: PathBuf,
    permits: Arc<Semaphore>,
    sets: Mutex<HashMap<SetKey, SetState>>,
    events: broadcast::Sender<Event>,
    shutdown: CancellationToken,
}

/// How waiting for a volume ended
enum Wait {
    Arrived,
    Late,
    Aborted(String),
}

/// Coordinator of running direct-unpack processes
pub(crate) struct DirectUnpacker {
    inner: Option<Arc<Inner>>,
}

impl DirectUnpacker {
    /// Enabled when the configuration asks for it and unrar can be found
    pub(crate) fn new(
        config: &Config,
        events: broadcast::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Self {
        if !config.processing.direct_unpack {
            return Self::disabled();
        }
        match config
            .tools
            .resolve_binary(config.tools.unrar_path.as_ref(), &["unrar", "rar"])
        {
            Some(unrar) => {
                info!(unrar = %unrar.display(), threads = config.processing.direct_unpack_threads, "direct unpack enabled");
                Self::with_binary(
                    unrar,
                    config.processing.direct_unpack_threads,
                    events,
                    shutdown,
                )
            }
            None => {
                warn!("direct unpack is enabled but no unrar binary was found");
                Self::disabled()
            }
        }
    }

    /// An unpacker that ignores every volume
    pub(crate) fn disabled() -> Self {
        Self { inner: None }
    }

    pub(crate) fn with_binary(
        unrar: PathBuf,
        threads: usize,
        events: broadcast::Sender<Event>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                unrar,
                permits: Arc::new(Semaphore::new(threads.max(1))),
                sets: Mutex::new(HashMap::new()),
                events,
                shutdown,
            })),
        }
    }

    /// A file of `job` was finalized on disk
    pub(crate) fn volume_done(&self, job: &UnpackJob, filename: &str, crc_ok: bool) {
        let Some(inner) = &self.inner else {
            return;
        };
        if !job.unpack {
            return;
        }
        let Some((setname, volume)) = rar_volume(filename) else {
            return;
        };
        let key = (job.id, setname.clone());
        let mut sets = inner.lock();
        let set = sets.entry(key.clone()).or_default();

        if !crc_ok {
            if set.abort_reason.is_none() {
                set.abort_reason = Some(format!("{filename} failed its CRC check"));
                set.abort.cancel();
                debug!(job_id = %job.id, setname = %setname, filename, "direct unpack set broken");
            }
            return;
        }
        if set.abort.is_cancelled() {
            return;
        }
        set.arrived.insert(volume);
        set.wake.notify_one();

        if volume == 1 && set.task.is_none() {
            let task = tokio::spawn(Arc::clone(inner).run_set(
                key,
                job.clone(),
                filename.to_string(),
                set.abort.clone(),
                Arc::clone(&set.wake),
            ));
            set.task = Some(task);
        }
    }

    /// Whether any set of `job` has been started
    pub(crate) fn has_sets(&self, job: JobId) -> bool {
        self.inner.as_ref().is_some_and(|inner| {
            inner
                .lock()
                .iter()
                .any(|((id, _), set)| *id == job && set.task.is_some())
        })
    }

    /// The download of `job` is over: abort sets still waiting for a
    /// volume, wait for the others and return the sets extracted completely
    pub(crate) async fn finish(&self, job: JobId) -> BTreeSet<String> {
        let Some(inner) = &self.inner else {
            return BTreeSet::new();
        };
        let tasks: Vec<(String, JoinHandle<bool>)> = inner
            .lock()
            .iter_mut()
            .filter(|((id, _), _)| *id == job)
            .filter_map(|((_, setname), set)| {
                set.download_finished = true;
                set.wake.notify_one();
                set.task.take().map(|task| (setname.clone(), task))
            })
            .collect();

        let mut done = BTreeSet::new();
        for (setname, task) in tasks {
            match task.await {
                Ok(true) => {
                    done.insert(setname);
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job, setname = %setname, error = %e, "direct unpack task failed"),
            }
        }
        inner.lock().retain(|(id, _), _| *id != job);
        done
    }

    /// Abort every set of a removed job
    pub(crate) fn cancel(&self, job: JobId) {
        if let Some(inner) = &self.inner {
            for ((id, _), set) in inner.lock().iter_mut() {
                if *id == job {
                    set.abort_reason.get_or_insert_with(|| "job removed".into());
                    set.abort.cancel();
                }
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SetKey, SetState>> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn abort_reason(&self, key: &SetKey) -> String {
        self.lock()
            .get(key)
            .and_then(|s| s.abort_reason.clone())
            .unwrap_or_else(|| "aborted".into())
    }

    /// Wait until `volume` of the set is on disk
    async fn wait_for_volume(
        &self,
        key: &SetKey,
        volume: u32,
        abort: &CancellationToken,
        wake: &Notify,
    ) -> Wait {
        loop {
            {
                let sets = self.lock();
                let Some(set) = sets.get(key) else {
                    return Wait::Late;
                };
                if set.arrived.contains(&volume) {
                    return Wait::Arrived;
                }
                if set.download_finished {
                    return Wait::Late;
                }
            }
            tokio::select! {
                _ = wake.notified() => {}
                _ = abort.cancelled() => return Wait::Aborted(self.abort_reason(key)),
                _ = self.shutdown.cancelled() => return Wait::Aborted("shutdown".into()),
            }
        }
    }

    /// Run unrar on one set; true when it reported `All OK`
    async fn run_set(
        self: Arc<Self>,
        key: SetKey,
        job: UnpackJob,
        first: String,
        abort: CancellationToken,
        wake: Arc<Notify>,
    ) -> bool {
        let setname = key.1.clone();
        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
            _ = abort.cancelled() => {
                self.aborted(&job, &setname, self.abort_reason(&key), &[]).await;
                return false;
            }
            _ = self.shutdown.cancelled() => return false,
        };

        let dest = job.download_path.join(EXTRACT_DIR);
        if let Err(e) = tokio::fs::create_dir_all(&dest).await {
            warn!(job_id = %job.id, error = %e, "cannot create direct unpack directory");
            return false;
        }
        let mut dest_arg = dest.as_os_str().to_owned();
        dest_arg.push(std::path::MAIN_SEPARATOR_STR);
        let password = match &job.password {
            Some(password) => format!("-p{password}"),
            None => "-p-".to_string(),
        };
        let args: Vec<OsString> = vec![
            "x".into(),
            "-vp".into(),
            "-o+".into(),
            password.into(),
            job.download_path.join(&first).into_os_string(),
            dest_arg,
        ];
        let mut process = match Supervised::spawn(&self.unrar, &args, Some(&job.download_path)) {
            Ok(process) => process,
            Err(e) => {
                warn!(job_id = %job.id, setname = %setname, error = %e, "direct unpack could not start");
                return false;
            }
        };
        info!(job_id = %job.id, setname = %setname, "direct unpack started");
        self.emit(Event::DirectUnpackStarted {
            id: job.id,
            setname: setname.clone(),
        });

        let mut extracted: Vec<PathBuf> = Vec::new();
        let mut current = 1u32;
        let mut all_ok = false;
        let failure = loop {
            let line = tokio::select! {
                line = process.next_line() => line,
                _ = abort.cancelled() => break Some(self.abort_reason(&key)),
                _ = self.shutdown.cancelled() => break Some("shutdown".to_string()),
            };
            let Some(line) = line else { break None };
            let trimmed = line.trim();

            if let Some(name) = trimmed.strip_prefix("Extracting from ") {
                if let Some((_, volume)) = rar_volume(file_name(name.trim())) {
                    current = volume;
                }
            } else if let Some(rest) = trimmed.strip_prefix("Extracting ") {
                if let Some(path) = extracted_path(rest, &dest) {
                    extracted.push(path);
                }
            } else if trimmed.contains("All OK") {
                all_ok = true;
            } else if trimmed.ends_with("[Q]uit") {
                match self.wait_for_volume(&key, current + 1, &abort, &wake).await {
                    Wait::Arrived => {
                        debug!(job_id = %job.id, setname = %setname, volume = current + 1, "continuing with next volume");
                        if let Err(e) = process.write(b"C\n").await {
                            break Some(format!("unrar stopped accepting input: {e}"));
                        }
                    }
                    Wait::Late => break Some(format!("volume {} was not ready in time", current + 1)),
                    Wait::Aborted(reason) => break Some(reason),
                }
            } else if trimmed.contains("password is incorrect") || trimmed.contains("CRC failed") {
                break Some(trimmed.to_string());
            }
        };

        if let Some(reason) = failure {
            let _ = process.write(b"Q\n").await;
            process.kill().await;
            self.aborted(&job, &setname, reason, &extracted).await;
            return false;
        }

        let success = match process.wait().await {
            Ok(status) => all_ok && status.success(),
            Err(_) => false,
        };
        if success {
            info!(job_id = %job.id, setname = %setname, files = extracted.len(), "direct unpack complete");
            self.emit(Event::DirectUnpackComplete {
                id: job.id,
                setname,
            });
        } else {
            self.aborted(&job, &setname, "unrar did not finish the set".into(), &extracted)
                .await;
        }
        success
    }

    async fn aborted(&self, job: &UnpackJob, setname: &str, reason: String, extracted: &[PathBuf]) {
        for path in extracted {
            if let Err(e) = tokio::fs::remove_file(path).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                debug!(path = %path.display(), error = %e, "failed to remove partial output");
            }
        }
        warn!(job_id = %job.id, setname, reason = %reason, "direct unpack aborted");
        self.emit(Event::DirectUnpackAborted { id: job.id, reason });
    }
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Target path from the text after `Extracting ` (`<path>   OK`)
///
/// Progress output (`\u{8}\u{8} 45%`) follows the name and is cut off.
fn extracted_path(rest: &str, dest: &Path) -> Option<PathBuf> {
    let name = rest.split('\u{8}').next().unwrap_or(rest).trim();
    let name = name.strip_suffix("OK").unwrap_or(name).trim_end();
    if name.is_empty() {
        return None;
    }
    let path = Path::new(name);
    Some(if path.is_absolute() {
        path.to_path_buf()
    } else {
        dest.join(path)
    })
}
