use serde::{Deserialize, Serialize};

use crate::server::ServerInfo;
use crate::trylist::TryList;
use crate::types::ServerId;

/// One Usenet message: a single segment of a file
///
/// The fetch state (`fetcher`, `fetcher_priority`, `tries`, `try_list`) is
/// transient and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Message-id without angle brackets
    pub message_id: String,
    /// Encoded size announced by the NZB
    pub bytes: u64,
    /// 1-based part number from the NZB
    pub number: u32,
    /// Whether this is the first segment of its file
    pub lowest_partnum: bool,
    /// Name of the spilled payload in the admin directory, once spilled
    #[serde(default)]
    pub art_id: Option<String>,
    /// Payload decoded and handed to the cache
    #[serde(default)]
    pub decoded: bool,
    /// Payload written to the output file
    #[serde(default)]
    pub on_disk: bool,
    /// Declared unavailable on every server
    #[serde(default)]
    pub missing: bool,
    /// CRC32 of the decoded payload
    #[serde(default)]
    pub crc32: Option<u32>,
    /// Decoded length in bytes
    #[serde(default)]
    pub decoded_size: Option<u64>,
    /// Zero-based offset of the payload in the output file (`=ypart begin` - 1)
    #[serde(default)]
    pub data_begin: Option<u64>,
    #[serde(skip)]
    pub(crate) fetcher: Option<ServerId>,
    #[serde(skip)]
    pub(crate) fetcher_priority: u32,
    #[serde(skip)]
    pub(crate) tries: u32,
    #[serde(skip)]
    pub(crate) try_list: TryList,
}

impl Article {
    /// Create an unfetched article
    pub fn new(message_id: impl Into<String>, bytes: u64, number: u32, lowest_partnum: bool) -> Self {
        Self {
            message_id: message_id.into(),
            bytes,
            number,
            lowest_partnum,
            art_id: None,
            decoded: false,
            on_disk: false,
            missing: false,
            crc32: None,
            decoded_size: None,
            data_begin: None,
            fetcher: None,
            fetcher_priority: 0,
            tries: 0,
            try_list: TryList::new(),
        }
    }

    /// Server currently fetching this article
    pub fn fetcher(&self) -> Option<ServerId> {
        self.fetcher
    }

    /// Number of attempts since the last fail-over
    pub fn tries(&self) -> u32 {
        self.tries
    }

    /// Servers already found unable to supply this article
    pub fn try_list(&self) -> &TryList {
        &self.try_list
    }

    /// Whether the article still has to be fetched
    pub fn is_pending(&self) -> bool {
        !self.decoded && !self.missing
    }

    /// Try to claim the article for `server`
    ///
    /// `servers` must be sorted by priority, best first. When a better server
    /// is active and has not been tried yet, the article is reserved for it:
    /// its priority level is recorded and the claim is refused.
    pub fn claim(&mut self, server: &ServerInfo, servers: &[ServerInfo]) -> bool {
        if self.fetcher.is_some() || self.try_list.contains(server.id) {
            return false;
        }
        if server.priority > self.fetcher_priority {
            for candidate in servers {
                if candidate.priority >= server.priority {
                    break;
                }
                if candidate.active && !self.try_list.contains(candidate.id) {
                    self.fetcher_priority = candidate.priority;
                    return false;
                }
            }
        }
        self.fetcher_priority = server.priority;
        self.fetcher = Some(server.id);
        self.tries += 1;
        true
    }

    /// Drop the current fetcher so the article can be handed out again
    pub fn release(&mut self) {
        self.fetcher = None;
    }

    /// Whether any active server may still supply the article after `fetcher` failed
    ///
    /// Only servers of equal or lower priority than the failed one qualify;
    /// better servers were already asked before this one got the article.
    pub fn has_fallback(&self, fetcher: &ServerInfo, servers: &[ServerInfo]) -> bool {
        servers.iter().any(|s| {
            s.active && !self.try_list.contains(s.id) && s.priority >= fetcher.priority
        })
    }
}
