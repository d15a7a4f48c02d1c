//! Decoded article payloads waiting for the assembler
//!
//! Payloads stay in memory up to the configured limit. Beyond it the oldest
//! entries spill to the job's admin directory as `SABnzbd_article_<file>_<index>`
//! and are read back (and deleted) when the assembler asks for them. Every
//! stored article exists exactly once, in memory or on disk, until it is
//! loaded or purged.
//!
//! The methods do blocking file I/O and are meant to be called from
//! `spawn_blocking` sections of the decoder and assembler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{ArticleRef, JobId};

/// Name of the spill file of an article
pub fn spill_name(article: ArticleRef) -> String {
    format!("SABnzbd_article_{}_{}", article.file, article.index)
}

#[derive(Debug, Default)]
struct Inner {
    order: VecDeque<ArticleRef>,
    memory: HashMap<ArticleRef, Vec<u8>>,
    in_memory_bytes: u64,
    on_disk: HashMap<ArticleRef, PathBuf>,
    admin: HashMap<JobId, PathBuf>,
}

/// Bounded store of decoded payloads
#[derive(Debug, Clone)]
pub struct ArticleCache {
    limit: i64,
    inner: Arc<Mutex<Inner>>,
}

impl ArticleCache {
    /// Cache with a byte ceiling (negative = unlimited, zero = disk only)
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bytes held in memory
    pub fn in_memory_bytes(&self) -> u64 {
        self.lock().in_memory_bytes
    }

    /// Number of stored articles (memory and disk)
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.memory.len() + inner.on_disk.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store the payload of `article`, spilling to `admin_dir` as needed
    pub fn store(&self, article: ArticleRef, admin_dir: &Path, data: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        inner
            .admin
            .entry(article.job)
            .or_insert_with(|| admin_dir.to_path_buf());

        if self.limit == 0 {
            let path = write_spill(article, admin_dir, &data)?;
            inner.on_disk.insert(article, path);
            return Ok(());
        }
        if self.limit > 0 {
            let limit = self.limit as u64;
            let len = data.len() as u64;
            while inner.in_memory_bytes + len > limit {
                let Some(&oldest) = inner.order.front() else {
                    break;
                };
                let dir = inner
                    .admin
                    .get(&oldest.job)
                    .cloned()
                    .unwrap_or_else(|| admin_dir.to_path_buf());
                let Some(payload) = inner.memory.get(&oldest) else {
                    inner.order.pop_front();
                    continue;
                };
                // the payload leaves memory only once its spill file exists
                let path = write_spill(oldest, &dir, payload)?;
                inner.spilled(oldest, path);
            }
            if len > limit {
                let path = write_spill(article, admin_dir, &data)?;
                inner.on_disk.insert(article, path);
                return Ok(());
            }
        }
        inner.in_memory_bytes += data.len() as u64;
        if inner.memory.insert(article, data).is_none() {
            inner.order.push_back(article);
        }
        Ok(())
    }

    /// Take the payload of `article` out of the cache
    ///
    /// Returns `None` when the article was never stored or already taken.
    pub fn load(&self, article: ArticleRef) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock();
        if let Some(data) = inner.memory.remove(&article) {
            inner.in_memory_bytes -= data.len() as u64;
            inner.order.retain(|a| *a != article);
            return Ok(Some(data));
        }
        let Some(path) = inner.on_disk.remove(&article) else {
            return Ok(None);
        };
        drop(inner);
        let data = std::fs::read(&path)?;
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to delete spilled article");
        }
        Ok(Some(data))
    }

    /// Drop every stored article of `job`, removing spill files
    pub fn purge_job(&self, job: JobId) {
        let mut inner = self.lock();
        let freed: u64 = inner
            .memory
            .iter()
            .filter(|(a, _)| a.job == job)
            .map(|(_, d)| d.len() as u64)
            .sum();
        inner.memory.retain(|a, _| a.job != job);
        inner.order.retain(|a| a.job != job);
        inner.in_memory_bytes -= freed;
        inner.admin.remove(&job);
        let files: Vec<PathBuf> = inner
            .on_disk
            .iter()
            .filter(|(a, _)| a.job == job)
            .map(|(_, p)| p.clone())
            .collect();
        inner.on_disk.retain(|a, _| a.job != job);
        drop(inner);
        for path in files {
            let _ = std::fs::remove_file(path);
        }
        debug!(job_id = %job, freed, "purged cached articles");
    }

    /// Drop the given articles, removing spill files
    pub fn purge(&self, articles: &[ArticleRef]) {
        let wanted: HashSet<ArticleRef> = articles.iter().copied().collect();
        let mut inner = self.lock();
        let mut files = Vec::new();
        for article in &wanted {
            if let Some(data) = inner.memory.remove(article) {
                inner.in_memory_bytes -= data.len() as u64;
            }
            if let Some(path) = inner.on_disk.remove(article) {
                files.push(path);
            }
        }
        inner.order.retain(|a| !wanted.contains(a));
        drop(inner);
        for path in files {
            let _ = std::fs::remove_file(path);
        }
    }

    /// Write every in-memory payload to disk (clean shutdown)
    ///
    /// Payloads that cannot be written stay in memory.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        let pending: Vec<ArticleRef> = inner.order.iter().copied().collect();
        for article in pending {
            let Some(dir) = inner.admin.get(&article.job).cloned() else {
                warn!(%article, "cached article has no admin directory, kept in memory");
                continue;
            };
            let Some(data) = inner.memory.get(&article) else {
                continue;
            };
            let path = write_spill(article, &dir, data)?;
            inner.spilled(article, path);
        }
        Ok(())
    }

    /// Register a spill file found on disk after a restart
    pub fn adopt(&self, article: ArticleRef, admin_dir: &Path) -> bool {
        let path = admin_dir.join(spill_name(article));
        if !path.is_file() {
            return false;
        }
        let mut inner = self.lock();
        inner
            .admin
            .entry(article.job)
            .or_insert_with(|| admin_dir.to_path_buf());
        inner.on_disk.insert(article, path);
        true
    }
}

impl Inner {
    /// `article` was written to `path`; drop the in-memory copy
    fn spilled(&mut self, article: ArticleRef, path: PathBuf) {
        if let Some(data) = self.memory.remove(&article) {
            self.in_memory_bytes -= data.len() as u64;
        }
        if self.order.front() == Some(&article) {
            self.order.pop_front();
        } else {
            self.order.retain(|a| *a != article);
        }
        self.on_disk.insert(article, path);
    }
}

fn write_spill(article: ArticleRef, dir: &Path, data: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(spill_name(article));
    std::fs::write(&path, data)?;
    Ok(path)
}
