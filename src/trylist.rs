//! Try-lists: the set of servers already found incapable of supplying an entity.
//!
//! Articles, files, jobs and the queue each carry one. To fetch an article on
//! a server, none of the four lists may contain that server (see
//! [`crate::queue::NzbQueue::get_articles`]).

use serde::{Deserialize, Serialize};

use crate::types::ServerId;

/// Maximum number of configured servers a try-list can track
pub const MAX_SERVERS: usize = 256;

const WORDS: usize = MAX_SERVERS / 64;

/// Fixed-size bitset of server ids
///
/// Membership tests, inserts and resets are O(1). Try-lists are transient
/// and never persisted; the serde impls only exist so that structures
/// holding one can derive `Serialize` and skip the field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryList {
    bits: [u64; WORDS],
}

impl TryList {
    /// Empty try-list
    #[must_use]
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    fn slot(server: ServerId) -> (usize, u64) {
        let idx = usize::from(server.0) % MAX_SERVERS;
        (idx / 64, 1u64 << (idx % 64))
    }

    /// Whether `server` has already been tried
    pub fn contains(&self, server: ServerId) -> bool {
        let (word, mask) = Self::slot(server);
        self.bits[word] & mask != 0
    }

    /// Record `server` as tried (idempotent)
    pub fn add(&mut self, server: ServerId) {
        let (word, mask) = Self::slot(server);
        self.bits[word] |= mask;
    }

    /// Forget a single server
    pub fn remove(&mut self, server: ServerId) {
        let (word, mask) = Self::slot(server);
        self.bits[word] &= !mask;
    }

    /// Forget every server
    pub fn reset(&mut self) {
        self.bits = [0; WORDS];
    }

    /// Whether every server in `servers` has been tried
    ///
    /// An empty server list is vacuously fully tried.
    pub fn all_of<I>(&self, servers: I) -> bool
    where
        I: IntoIterator<Item = ServerId>,
    {
        servers.into_iter().all(|s| self.contains(s))
    }

    /// Whether nothing has been tried yet
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    /// Number of servers tried
    pub fn len(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}
