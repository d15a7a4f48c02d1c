use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::file::{FileProgress, NzbFile};
use crate::config::{Config, DownloadConfig, PostProcess};
use crate::error::{DownloadError, Error, Result};
use crate::nzb::{ParsedNzb, file_sort_key, scan_password, strip_nzb_extension};
use crate::par2::{Par2FileInfo, similarity};
use crate::server::ServerInfo;
use crate::trylist::TryList;
use crate::types::{
    ArticleRef, FileId, HistoryEntry, JobId, JobOptions, JobSummary, Priority, ServerId, Status,
};
use crate::utils::hex_string;

/// Set names at least this similar belong to the same par2 family
const SETNAME_SIMILARITY: f64 = 0.85;

/// Fraction of failed first articles above which a job is hopeless
const FAST_FAIL_RATIO: f64 = 0.8;

/// Minimum number of sampled first articles before fast-fail may trigger
const FAST_FAIL_MIN_SAMPLE: u32 = 5;

/// What happened after an article was resolved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registered {
    /// The owning file has no pending articles left
    pub file_done: bool,
    /// Par2 blocks promoted to compensate for the failure
    pub promoted_blocks: u32,
    /// Par2 set the promoted volumes belong to
    pub promoted_set: Option<String>,
    /// The job can no longer complete
    pub hopeless: Option<String>,
}

/// One job: an NZB with its files, policy and statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NzbObject {
    /// Job id
    pub id: JobId,
    /// Display name (NZB name without extension and password)
    pub name: String,
    /// Name of the NZB the job was created from
    pub nzb_name: String,
    /// Category
    pub category: Option<String>,
    /// Queue priority
    pub priority: Priority,
    /// Lifecycle status
    pub status: Status,
    /// Repair/unpack/delete policy
    pub post_process: PostProcess,
    /// Archive password
    pub password: Option<String>,
    /// User script
    pub script: Option<PathBuf>,
    /// Source URL
    pub url: Option<String>,
    /// File arena, indexed by [`FileId`]
    pub files: Vec<NzbFile>,
    /// Files still being downloaded, in download order
    pub active: Vec<FileId>,
    /// Files with every article resolved
    pub finished: Vec<FileId>,
    /// Held-back par2 volumes per set name, ordered by block count
    pub extrapars: BTreeMap<String, Vec<FileId>>,
    /// Par2 file descriptions per set name, keyed by filename
    pub par2packs: HashMap<String, HashMap<String, Par2FileInfo>>,
    /// Hex MD5 of the first 16 KiB -> real filename
    pub md5of16k: HashMap<String, String>,
    /// Files whose first article is still part of the availability sample
    pub first_articles: Vec<FileId>,
    /// Size of the availability sample
    pub first_articles_count: u32,
    /// Sampled first articles that failed
    pub first_articles_failed: u32,
    /// Total announced bytes, held-back par2 included
    pub bytes: u64,
    /// Bytes fetched successfully
    pub bytes_downloaded: u64,
    /// Bytes attempted (success or failure)
    pub bytes_tried: u64,
    /// Bytes unavailable on every server
    pub bytes_missing: u64,
    /// Bytes of all par2 recovery volumes, held back or not
    pub bytes_par2: u64,
    /// Articles unavailable on every server
    pub bad_articles: u64,
    /// Decoded articles waiting in the cache for the assembler
    pub saved_articles: BTreeSet<(FileId, u32)>,
    /// Incomplete directory of this job
    pub download_path: PathBuf,
    /// Admin directory of this job
    pub admin_path: PathBuf,
    /// Average posting date (Unix seconds)
    pub avg_date: i64,
    /// When the job was added
    pub added: DateTime<Utc>,
    /// When the first article was fetched
    pub download_started: Option<DateTime<Utc>>,
    /// Fetch with STAT/HEAD only to measure availability
    pub precheck: bool,
    /// Why the job failed
    pub fail_message: Option<String>,
    /// Current filename -> original filename
    pub renames: BTreeMap<String, String>,
    /// Par2 set name -> verified
    pub verified: BTreeMap<String, bool>,
    /// RAR sets fully extracted by the direct unpacker
    pub direct_unpacked: BTreeSet<String>,
    #[serde(skip)]
    pub(crate) try_list: TryList,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
}

impl NzbObject {
    /// Build a job from a parsed NZB
    ///
    /// `nzb_name` is the filename of the NZB; the job name and an embedded
    /// password are derived from it. The priority in `options` must already
    /// be resolved (see [`Priority::resolve_on_add`]).
    pub fn from_parsed(
        parsed: ParsedNzb,
        nzb_name: &str,
        options: &JobOptions,
        paused: bool,
        config: &Config,
    ) -> Result<Self> {
        if parsed.files.is_empty() {
            return Err(Error::InvalidNzb("NZB contains no usable files".into()));
        }

        let (name, name_password) = scan_password(strip_nzb_extension(nzb_name));
        let name = if name.trim().is_empty() {
            "unnamed".to_string()
        } else {
            name
        };
        let password = options
            .password
            .clone()
            .or_else(|| parsed.password().map(str::to_string))
            .or(name_password)
            .filter(|p| !p.is_empty());
        let category = options
            .category
            .clone()
            .or_else(|| parsed.category().map(str::to_string));
        let post_process = options
            .post_process
            .unwrap_or(config.processing.default_post_process);

        let mut files: Vec<NzbFile> = parsed
            .files
            .iter()
            .enumerate()
            .map(|(i, f)| NzbFile::from_parsed(FileId(i as u32), f))
            .collect();
        files.sort_by(|a, b| file_sort_key(&a.filename, &b.filename));
        for (i, file) in files.iter_mut().enumerate() {
            file.id = FileId(i as u32);
        }

        let conflicting: u64 = parsed
            .files
            .iter()
            .map(|f| u64::from(f.conflicting_duplicates))
            .sum();
        if conflicting > 0 {
            warn!(nzb = nzb_name, conflicting, "NZB has conflicting duplicate segments");
        }

        let avg_date = files.iter().map(|f| f.date).sum::<i64>() / files.len() as i64;
        let bytes = files.iter().map(|f| f.bytes).sum();
        let id = JobId::generate();
        let download_path = config.download_dir().join(&name);
        let admin_path = download_path.join(crate::persistence::ADMIN_DIR);

        let mut job = Self {
            id,
            name,
            nzb_name: nzb_name.to_string(),
            category,
            priority: options.priority,
            status: if paused { Status::Paused } else { Status::Queued },
            post_process,
            password,
            script: options.script.clone(),
            url: options.url.clone(),
            files,
            active: Vec::new(),
            finished: Vec::new(),
            extrapars: BTreeMap::new(),
            par2packs: HashMap::new(),
            md5of16k: HashMap::new(),
            first_articles: Vec::new(),
            first_articles_count: 0,
            first_articles_failed: 0,
            bytes,
            bytes_downloaded: 0,
            bytes_tried: 0,
            bytes_missing: 0,
            bytes_par2: 0,
            bad_articles: conflicting,
            saved_articles: BTreeSet::new(),
            download_path,
            admin_path,
            avg_date,
            added: Utc::now(),
            download_started: None,
            precheck: config.download.pre_check,
            fail_message: None,
            renames: BTreeMap::new(),
            verified: BTreeMap::new(),
            direct_unpacked: BTreeSet::new(),
            try_list: TryList::new(),
            cancel: CancellationToken::new(),
        };
        job.distribute_files(config.processing.enable_all_par);
        Ok(job)
    }

    /// Split files into the active list and the held-back par2 sets
    fn distribute_files(&mut self, enable_all_par: bool) {
        let hold_back = self.post_process.repair() && !enable_all_par;
        for file in &self.files {
            if file.is_par2_volume() {
                self.bytes_par2 += file.bytes;
            }
            if hold_back
                && file.is_par2_volume()
                && let Some(setname) = &file.setname
            {
                self.extrapars
                    .entry(setname.clone())
                    .or_default()
                    .push(file.id);
            } else {
                self.active.push(file.id);
                if !file.is_par2 {
                    self.first_articles.push(file.id);
                }
            }
        }
        for set in self.extrapars.values_mut() {
            set.sort_by_key(|id| self.files[id.0 as usize].blocks);
        }
        self.first_articles_count = self.first_articles.len() as u32;
        debug!(
            job_id = %self.id,
            active = self.active.len(),
            par2_sets = self.extrapars.len(),
            "distributed job files"
        );
    }

    /// Servers already found unable to supply anything from this job
    pub fn try_list(&self) -> &TryList {
        &self.try_list
    }

    /// Token cancelled when the job is removed
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the job was removed while work was in flight
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// File by id
    pub fn file(&self, id: FileId) -> Option<&NzbFile> {
        self.files.get(id.0 as usize)
    }

    /// Mutable file by id
    pub fn file_mut(&mut self, id: FileId) -> Option<&mut NzbFile> {
        self.files.get_mut(id.0 as usize)
    }

    /// Path of a file inside the incomplete directory
    pub fn file_path(&self, id: FileId) -> Option<PathBuf> {
        self.file(id).map(|f| self.download_path.join(&f.filename))
    }

    /// Bytes of par2 volumes still held back
    pub fn bytes_held_back(&self) -> u64 {
        self.extrapars
            .values()
            .flatten()
            .filter_map(|id| self.file(*id))
            .map(|f| f.bytes)
            .sum()
    }

    /// Bytes neither fetched nor declared missing, held-back par2 excluded
    pub fn bytes_remaining(&self) -> u64 {
        self.bytes
            .saturating_sub(self.bytes_held_back())
            .saturating_sub(self.bytes_downloaded)
            .saturating_sub(self.bytes_missing)
    }

    /// Download progress in percent
    pub fn percent(&self) -> f32 {
        let total = self.bytes.saturating_sub(self.bytes_held_back());
        if total == 0 {
            return 100.0;
        }
        (self.bytes_downloaded as f64 / total as f64 * 100.0) as f32
    }

    /// Whether the downloader may hand out articles of this job
    pub fn is_downloadable(&self) -> bool {
        matches!(
            self.status,
            Status::Queued | Status::Downloading | Status::Checking
        )
    }

    /// Job posted less than `delay` ago
    pub fn in_propagation_delay(&self, delay: Duration, now: DateTime<Utc>) -> bool {
        if delay.is_zero() {
            return false;
        }
        now.timestamp() - self.avg_date < delay.as_secs() as i64
    }

    /// Posted before `now - retention`
    pub fn older_than(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        !retention.is_zero() && self.avg_date < now.timestamp() - retention.as_secs() as i64
    }

    /// Hand out up to `limit` articles to `server`
    ///
    /// First articles go out first so availability is sampled early. When
    /// nothing could be claimed the server joins the job's try-list.
    pub fn get_articles(
        &mut self,
        server: &ServerInfo,
        servers: &[ServerInfo],
        limit: usize,
        out: &mut Vec<ArticleRef>,
    ) -> usize {
        if self.try_list.contains(server.id) {
            return 0;
        }
        let job = self.id;
        let mut found = 0;

        for &file_id in &self.first_articles {
            if found >= limit {
                break;
            }
            let Some(article) = self
                .files
                .get_mut(file_id.0 as usize)
                .filter(|f| !f.try_list.contains(server.id))
                .and_then(|f| f.article_mut(0))
            else {
                continue;
            };
            if article.is_pending() && article.claim(server, servers) {
                out.push(ArticleRef {
                    job,
                    file: file_id,
                    index: 0,
                });
                found += 1;
            }
        }

        let mut indices = Vec::new();
        for &file_id in &self.active {
            if found >= limit {
                break;
            }
            let Some(file) = self.files.get_mut(file_id.0 as usize) else {
                continue;
            };
            if file.completed || file.try_list.contains(server.id) {
                continue;
            }
            indices.clear();
            found += file.get_articles(server, servers, limit - found, &mut indices);
            out.extend(indices.iter().map(|&index| ArticleRef {
                job,
                file: file_id,
                index,
            }));
        }

        if found == 0 {
            self.try_list.add(server.id);
        } else if self.status == Status::Queued {
            self.status = if self.precheck {
                Status::Checking
            } else {
                Status::Downloading
            };
            self.download_started.get_or_insert_with(Utc::now);
        }
        found
    }

    /// Look for another server after `fetcher` could not supply an article
    ///
    /// Returns `true` when an active server of equal or lower priority has
    /// not been tried yet; the file and job try-lists are then cleared so the
    /// article is handed out again. The caller resets the queue try-list.
    pub fn search_new_server(
        &mut self,
        article: ArticleRef,
        fetcher: ServerId,
        servers: &[ServerInfo],
    ) -> bool {
        let Some(current) = servers.iter().find(|s| s.id == fetcher) else {
            return false;
        };
        let Some(file) = self.files.get_mut(article.file.0 as usize) else {
            return false;
        };
        let Some(art) = file.article_mut(article.index) else {
            return false;
        };
        art.try_list.add(fetcher);
        art.fetcher = None;
        if art.has_fallback(current, servers) {
            art.tries = 0;
            file.try_list.reset();
            self.try_list.reset();
            return true;
        }
        info!(
            job_id = %self.id,
            message_id = %art.message_id,
            "article unavailable on all servers, discarding"
        );
        false
    }

    /// Give an article back after a connection failure
    ///
    /// With `exhausted` the fetcher stays in the article's try-list (it
    /// failed too often); otherwise the same server may try again.
    pub fn reset_article(&mut self, article: ArticleRef, exhausted: bool) {
        let Some(file) = self.files.get_mut(article.file.0 as usize) else {
            return;
        };
        if let Some(art) = file.article_mut(article.index) {
            if let Some(fetcher) = art.fetcher.take()
                && exhausted
            {
                art.try_list.add(fetcher);
            }
        }
        file.try_list.reset();
        self.try_list.reset();
    }

    /// Record the outcome of an article
    pub fn register_article(
        &mut self,
        article: ArticleRef,
        success: bool,
        config: &DownloadConfig,
    ) -> Registered {
        let mut result = Registered::default();
        let Some(file) = self.files.get_mut(article.file.0 as usize) else {
            return result;
        };
        let Some(bytes) = file
            .article(article.index)
            .filter(|a| a.is_pending())
            .map(|a| a.bytes)
        else {
            return result;
        };
        let is_par2 = file.is_par2;
        let progress = file.remove_article(article.index, success);

        self.bytes_tried += bytes;
        if success {
            self.bytes_downloaded += bytes;
        } else {
            self.bytes_missing += bytes;
            self.bad_articles += 1;
        }

        if article.index == 0 && self.first_articles.contains(&article.file) {
            self.first_articles.retain(|&f| f != article.file);
            if !success {
                self.first_articles_failed += 1;
            }
        }

        if progress == FileProgress::Done {
            self.active.retain(|&f| f != article.file);
            self.finished.push(article.file);
            result.file_done = true;
        }

        if !success {
            if config.prospective_par_download && self.post_process.repair() && !is_par2 {
                if let Some((setname, blocks)) = self.prospective_add(article.file) {
                    result.promoted_blocks = blocks;
                    result.promoted_set = Some(setname);
                }
            }
            if config.fail_hopeless_jobs && !self.precheck {
                result.hopeless = self.hopeless_reason(config);
            }
        }
        result
    }

    /// Availability as `(enough, ratio)`
    ///
    /// The ratio relates the bytes still obtainable to the data bytes, so
    /// par2 volumes raise it above 100% because they can compensate for
    /// missing data.
    pub fn check_availability_ratio(&self, required: f64) -> (bool, f64) {
        let mut ratio = required;
        if self.bytes > self.bytes_par2 {
            ratio = 100.0 * (self.bytes - self.bytes_missing.min(self.bytes)) as f64
                / (self.bytes - self.bytes_par2) as f64;
        }
        (ratio >= required, ratio)
    }

    /// Why the job cannot complete, if it cannot
    pub fn hopeless_reason(&self, config: &DownloadConfig) -> Option<String> {
        let (enough, ratio) = self.check_availability_ratio(config.req_completion_rate);
        if !enough {
            return Some(format!(
                "{ratio:.1}% available, {:.1}% required",
                config.req_completion_rate
            ));
        }
        if config.fast_fail
            && self.first_articles_count >= FAST_FAIL_MIN_SAMPLE
            && self.first_articles.is_empty()
            && f64::from(self.first_articles_failed) / f64::from(self.first_articles_count)
                > FAST_FAIL_RATIO
        {
            return Some(format!(
                "{} of {} first articles failed",
                self.first_articles_failed, self.first_articles_count
            ));
        }
        None
    }

    /// Promote par2 blocks to compensate for the articles missing so far
    fn prospective_add(&mut self, failed_file: FileId) -> Option<(String, u32)> {
        if self.extrapars.is_empty() {
            return None;
        }
        let filename = self
            .file(failed_file)
            .map(|f| f.filename.clone())
            .unwrap_or_default();
        let setname = if self.extrapars.len() == 1 {
            self.extrapars.keys().next().cloned()
        } else {
            self.extrapars
                .keys()
                .find(|set| filename.contains(set.as_str()) || self.name.contains(set.as_str()))
                .cloned()
        };
        let setname = setname?;
        let queued = self.queued_par2_blocks();
        let needed = self.bad_articles.saturating_sub(queued);
        if needed == 0 {
            return None;
        }
        let added = self.get_extra_blocks(&setname, u32::try_from(needed).unwrap_or(u32::MAX));
        if added == 0 {
            return None;
        }
        info!(job_id = %self.id, setname, added, "prospectively added repair blocks");
        Some((setname, added))
    }

    /// Recovery blocks of par2 volumes already in the download
    fn queued_par2_blocks(&self) -> u64 {
        self.active
            .iter()
            .chain(self.finished.iter())
            .filter_map(|id| self.file(*id))
            .filter(|f| f.is_par2_volume())
            .map(|f| u64::from(f.blocks))
            .sum()
    }

    /// Move held-back par2 volumes of `setname` into the download until at
    /// least `needed` blocks were added
    ///
    /// Sets whose names are at least 85% similar are treated as one family.
    /// Returns the number of blocks added (possibly fewer than `needed` when
    /// the sets run dry).
    pub fn get_extra_blocks(&mut self, setname: &str, needed: u32) -> u32 {
        let keys: Vec<String> = self
            .extrapars
            .keys()
            .filter(|key| key.as_str() == setname || similarity(key, setname) >= SETNAME_SIMILARITY)
            .cloned()
            .collect();

        let mut candidates: Vec<FileId> = keys
            .iter()
            .filter_map(|k| self.extrapars.get(k))
            .flatten()
            .copied()
            .collect();
        candidates.sort_by_key(|id| (self.files[id.0 as usize].blocks, id.0));

        let mut added = 0u32;
        let mut promoted = Vec::new();
        for id in candidates {
            if added >= needed {
                break;
            }
            let Some(file) = self.files.get_mut(id.0 as usize) else {
                continue;
            };
            file.reset_all_try_lists();
            added += file.blocks;
            promoted.push(id);
        }

        for key in &keys {
            if let Some(set) = self.extrapars.get_mut(key) {
                set.retain(|id| !promoted.contains(id));
                if set.is_empty() {
                    self.extrapars.remove(key);
                }
            }
        }
        self.active.extend(promoted.iter().copied());
        self.try_list.reset();

        if added > 0 {
            debug!(job_id = %self.id, setname, needed, added, files = promoted.len(), "promoted par2 volumes");
        }
        added
    }

    /// Recovery blocks still held back for `setname` and its similar sets
    pub fn available_extra_blocks(&self, setname: &str) -> u32 {
        self.extrapars
            .iter()
            .filter(|(key, _)| key.as_str() == setname || similarity(key, setname) >= SETNAME_SIMILARITY)
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.file(*id))
            .map(|f| f.blocks)
            .sum()
    }

    /// Remember the par2 file descriptions of a set and rename obfuscated
    /// files whose first-16k MD5 matches
    ///
    /// Returns `(file, old name, new name)` for every renamed file.
    pub fn apply_par2_pack(
        &mut self,
        setname: &str,
        pack: HashMap<String, Par2FileInfo>,
    ) -> Vec<(FileId, String, String)> {
        for (name, info) in &pack {
            self.md5of16k
                .entry(hex_string(&info.hash16k))
                .or_insert_with(|| name.clone());
        }
        self.par2packs.insert(setname.to_string(), pack);

        let mut renamed = Vec::new();
        for file in &mut self.files {
            if file.is_par2 {
                continue;
            }
            let Some(hash) = file.md5of16k else { continue };
            let Some(real) = self.md5of16k.get(&hex_string(&hash)) else {
                continue;
            };
            if *real == file.filename || real.is_empty() {
                continue;
            }
            let old = std::mem::replace(&mut file.filename, real.clone());
            let original = self.renames.remove(&old).unwrap_or_else(|| old.clone());
            self.renames.insert(file.filename.clone(), original);
            renamed.push((file.id, old, file.filename.clone()));
        }
        for (_, old, new) in &renamed {
            info!(job_id = %self.id, old = %old, new = %new, "renamed file from par2 metadata");
        }
        renamed
    }

    /// Whether every file is resolved and assembled
    pub fn is_done(&self) -> bool {
        self.active.is_empty()
            && self.saved_articles.is_empty()
            && self
                .finished
                .iter()
                .all(|id| self.file(*id).is_some_and(|f| f.assembled))
    }

    /// Clear try-lists of the job, its files and their articles
    pub fn reset_all_try_lists(&mut self) {
        self.try_list.reset();
        for file in &mut self.files {
            file.reset_all_try_lists();
        }
    }

    /// Clear the job try-list only
    pub fn reset_try_list(&mut self) {
        self.try_list.reset();
    }

    /// Release every article claimed by `server`
    pub fn release_server(&mut self, server: ServerId) {
        for file in &mut self.files {
            file.release_server(server);
        }
    }

    /// Turn a passed pre-check into a real download
    pub fn reset_for_download(&mut self) {
        self.precheck = false;
        self.bytes_downloaded = 0;
        self.bytes_tried = 0;
        self.bytes_missing = 0;
        self.bad_articles = 0;
        self.first_articles_failed = 0;
        self.active.clear();
        self.finished.clear();
        self.saved_articles.clear();
        for file in &mut self.files {
            file.completed = false;
            file.assembled = false;
            file.bytes_left = file.bytes;
            for article in &mut file.decodetable {
                article.decoded = false;
                article.missing = false;
                article.fetcher = None;
                article.tries = 0;
            }
            file.articles = (0..file.decodetable.len() as u32).collect();
        }
        let held: BTreeSet<FileId> = self.extrapars.values().flatten().copied().collect();
        self.active = self
            .files
            .iter()
            .map(|f| f.id)
            .filter(|id| !held.contains(id))
            .collect();
        self.first_articles = self
            .active
            .iter()
            .copied()
            .filter(|id| self.file(*id).is_some_and(|f| !f.is_par2))
            .collect();
        self.first_articles_count = self.first_articles.len() as u32;
        self.reset_all_try_lists();
        self.status = Status::Queued;
    }

    /// Move to `next`, refusing transitions out of terminal states
    pub fn set_status(&mut self, next: Status) -> Result<()> {
        if !self.status.can_transition_to(next) {
            if self.status == next {
                return Ok(());
            }
            return Err(Error::Download(DownloadError::InvalidState {
                id: self.id.to_string(),
                operation: format!("move to {next}"),
                current_state: self.status.to_string(),
            }));
        }
        debug!(job_id = %self.id, from = %self.status, to = %next, "job status change");
        self.status = next;
        Ok(())
    }

    /// Mark the job failed with a message
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(job_id = %self.id, name = %self.name, reason = %message, "job failed");
        self.fail_message = Some(message);
        if !self.status.is_terminal() {
            self.status = Status::Failed;
        }
    }

    /// Time spent downloading
    pub fn download_time(&self) -> Duration {
        self.download_started
            .and_then(|start| (Utc::now() - start).to_std().ok())
            .unwrap_or_default()
    }

    /// Queue summary
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            priority: self.priority,
            size_bytes: self.bytes,
            downloaded_bytes: self.bytes_downloaded,
            missing_bytes: self.bytes_missing,
        }
    }

    /// History record for a finished job
    pub fn history_entry(&self, destination: Option<&Path>) -> HistoryEntry {
        HistoryEntry {
            id: 0,
            job_id: self.id,
            name: self.name.clone(),
            category: self.category.clone(),
            destination: destination.map(Path::to_path_buf),
            status: self.status,
            fail_message: self.fail_message.clone(),
            size_bytes: self.bytes,
            download_time: self.download_time(),
            completed_at: Utc::now(),
        }
    }
}
