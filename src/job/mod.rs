//! Job data model: articles, files and the job itself
//!
//! A job ([`NzbObject`]) owns its files ([`NzbFile`]) in an arena indexed by
//! [`FileId`](crate::types::FileId); each file owns its articles
//! ([`Article`]) in part order. Other subsystems refer to articles through
//! [`ArticleRef`](crate::types::ArticleRef) handles and resolve them under
//! the queue lock.
//!
//! The fetch bookkeeping lives here as well: per-article server claims with
//! priority reservation, fail-over to lower-priority servers, par2 volume
//! promotion when articles go missing, and hopeless-job detection.

mod article;
mod file;
mod object;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use article::Article;
pub use file::{FileProgress, NzbFile};
pub use object::{NzbObject, Registered};

/// What a server delivered for one article
///
/// Errors attributable to the server never reach this type; they are
/// classified by [`crate::server::classify_error`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleOutcome {
    /// Raw body as received (still yEnc encoded and dot-stuffed)
    Fetched(Vec<u8>),
    /// `STAT`/`HEAD` confirmed the article exists (pre-check)
    Present,
    /// No server could supply the article
    Missing,
}
