use serde::{Deserialize, Serialize};

use super::article::Article;
use crate::decoder::CrcTracker;
use crate::nzb::{ParsedFile, analyse_par2, name_extractor};
use crate::server::ServerInfo;
use crate::trylist::TryList;
use crate::types::{FileId, ServerId};

/// Result of resolving one article of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileProgress {
    /// Articles remain
    Pending,
    /// Last article resolved; the file can be finalized
    Done,
}

/// One output file of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NzbFile {
    /// Position in the job's file arena
    pub id: FileId,
    /// Raw NNTP subject
    pub subject: String,
    /// Current filename (from the subject, later possibly from par2 metadata)
    pub filename: String,
    /// Posting date (Unix seconds)
    pub date: i64,
    /// Newsgroups
    pub groups: Vec<String>,
    /// Total announced bytes
    pub bytes: u64,
    /// Announced bytes of articles not yet resolved
    pub bytes_left: u64,
    /// Number of segments in the file
    pub segment_count: u32,
    /// All segments in part order; only the first one until the import is finished
    #[serde(skip)]
    pub decodetable: Vec<Article>,
    /// Indices into `decodetable` still to be fetched
    #[serde(skip)]
    pub(crate) articles: Vec<u32>,
    /// Whether `decodetable` holds every segment
    #[serde(skip)]
    pub import_finished: bool,
    /// Par2 recovery file
    pub is_par2: bool,
    /// Par2 set name
    pub setname: Option<String>,
    /// Par2 starting exponent
    pub vol: u32,
    /// Par2 recovery blocks
    pub blocks: u32,
    /// CRC32 folded from the decoded segments
    pub crc: CrcTracker,
    /// Full-file CRC32 announced by a yEnc trailer (`crc32=`)
    pub expected_crc: Option<u32>,
    /// MD5 of the first 16 KiB, taken from the first segment
    pub md5of16k: Option<[u8; 16]>,
    /// All articles resolved
    pub completed: bool,
    /// Finalized on disk by the assembler
    pub assembled: bool,
    #[serde(skip)]
    pub(crate) try_list: TryList,
}

impl NzbFile {
    /// Build a file from its parsed NZB entry
    pub fn from_parsed(id: FileId, parsed: &ParsedFile) -> Self {
        let filename = name_extractor(&parsed.subject);
        let decodetable: Vec<Article> = parsed
            .segments
            .iter()
            .enumerate()
            .map(|(i, s)| Article::new(s.message_id.clone(), s.bytes, s.number, i == 0))
            .collect();
        let bytes = parsed.bytes();
        let mut file = Self {
            id,
            subject: parsed.subject.clone(),
            filename,
            date: parsed.date,
            groups: parsed.groups.clone(),
            bytes,
            bytes_left: bytes,
            segment_count: decodetable.len() as u32,
            articles: (0..decodetable.len() as u32).collect(),
            decodetable,
            import_finished: true,
            is_par2: false,
            setname: None,
            vol: 0,
            blocks: 0,
            crc: CrcTracker::default(),
            expected_crc: None,
            md5of16k: None,
            completed: false,
            assembled: false,
            try_list: TryList::new(),
        };
        file.classify_par2();
        file
    }

    /// Refresh the par2 classification from the current filename
    pub fn classify_par2(&mut self) {
        match analyse_par2(&self.filename) {
            Some(par) => {
                self.is_par2 = true;
                self.setname = Some(par.setname);
                self.vol = par.vol;
                self.blocks = par.blocks;
            }
            None => {
                self.is_par2 = false;
                self.setname = None;
                self.vol = 0;
                self.blocks = 0;
            }
        }
    }

    /// Par2 volume carrying recovery blocks (not the index file)
    pub fn is_par2_volume(&self) -> bool {
        self.is_par2 && self.blocks > 0
    }

    /// Servers already found unable to supply anything from this file
    pub fn try_list(&self) -> &TryList {
        &self.try_list
    }

    /// Number of articles still to be resolved
    pub fn pending_articles(&self) -> usize {
        if self.import_finished {
            self.articles.len()
        } else {
            self.segment_count as usize
                - self
                    .decodetable
                    .iter()
                    .filter(|a| !a.is_pending())
                    .count()
        }
    }

    /// Article by decode-table index
    pub fn article(&self, index: u32) -> Option<&Article> {
        self.decodetable.get(index as usize)
    }

    /// Mutable article by decode-table index
    pub fn article_mut(&mut self, index: u32) -> Option<&mut Article> {
        self.decodetable.get_mut(index as usize)
    }

    /// Keep only the first article in memory; the rest live in the admin table
    pub fn unload_articles(&mut self) {
        if self.decodetable.len() <= 1 {
            return;
        }
        self.decodetable.truncate(1);
        self.articles.retain(|&i| i == 0);
        self.import_finished = false;
    }

    /// Install the full decode table read back from the admin directory
    ///
    /// Articles already in memory keep their state; the pending list is
    /// rebuilt from the merged table.
    pub fn install_articles(&mut self, mut table: Vec<Article>) {
        if self.import_finished {
            return;
        }
        for (i, current) in self.decodetable.drain(..).enumerate() {
            if let Some(slot) = table.get_mut(i) {
                *slot = current;
            }
        }
        self.articles = table
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_pending())
            .map(|(i, _)| i as u32)
            .collect();
        self.segment_count = table.len() as u32;
        self.decodetable = table;
        self.import_finished = true;
    }

    /// Hand out up to `limit` articles to `server`
    ///
    /// Adds the server to the file's try-list when nothing could be claimed.
    pub fn get_articles(
        &mut self,
        server: &ServerInfo,
        servers: &[ServerInfo],
        limit: usize,
        out: &mut Vec<u32>,
    ) -> usize {
        let mut found = 0;
        for &index in &self.articles {
            if found >= limit {
                break;
            }
            let Some(article) = self.decodetable.get_mut(index as usize) else {
                continue;
            };
            if article.claim(server, servers) {
                out.push(index);
                found += 1;
            }
        }
        if found == 0 && self.import_finished {
            self.try_list.add(server.id);
        }
        found
    }

    /// Mark an article resolved, successfully or not
    ///
    /// Returns [`FileProgress::Done`] exactly once, when the last pending
    /// article of a fully imported file is resolved.
    pub fn remove_article(&mut self, index: u32, success: bool) -> FileProgress {
        let Some(article) = self.decodetable.get_mut(index as usize) else {
            return FileProgress::Pending;
        };
        if !article.is_pending() {
            return FileProgress::Pending;
        }
        if success {
            article.decoded = true;
        } else {
            article.missing = true;
        }
        article.fetcher = None;
        self.bytes_left = self.bytes_left.saturating_sub(article.bytes);
        self.articles.retain(|&i| i != index);

        if self.articles.is_empty() && self.import_finished && !self.completed {
            self.completed = true;
            FileProgress::Done
        } else {
            FileProgress::Pending
        }
    }

    /// Record the CRC32 and size of a decoded segment
    pub fn record_segment(&mut self, index: u32, crc: u32, size: u64, begin: Option<u64>) {
        if let Some(article) = self.decodetable.get_mut(index as usize) {
            article.crc32 = Some(crc);
            article.decoded_size = Some(size);
            article.data_begin = begin;
        }
        self.crc.add(index, crc, size);
    }

    /// Whether every segment decoded and the combined CRC matches the announced one
    pub fn crc_ok(&self) -> bool {
        if self.crc.covered() < self.segment_count {
            return false;
        }
        self.expected_crc.is_none_or(|expected| expected == self.crc.crc())
    }

    /// Clear the file try-list and those of all its articles
    pub fn reset_all_try_lists(&mut self) {
        self.try_list.reset();
        for article in &mut self.decodetable {
            article.try_list.reset();
            article.fetcher_priority = 0;
        }
    }

    /// Release every claim held by `server`
    pub fn release_server(&mut self, server: ServerId) {
        for article in &mut self.decodetable {
            if article.fetcher == Some(server) {
                article.fetcher = None;
            }
        }
    }
}
