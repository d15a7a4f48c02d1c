//! NZB manifest parsing and name analysis
//!
//! An NZB lists the files of a post, each with its subject, posting date,
//! groups and ordered segments (one Usenet article each). Parsing produces a
//! [`ParsedNzb`]; turning that into a queue job is done by
//! [`crate::job::NzbObject::from_parsed`].

mod names;
mod parser;

pub use names::{
    Par2Name, analyse_par2, file_sort_key, is_par2_name, name_extractor, scan_password,
    strip_nzb_extension,
};
pub use parser::{MAX_SEGMENT_BYTES, parse_nzb, parse_nzb_auto};

use std::collections::HashMap;

/// One `<segment>` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSegment {
    /// 1-based part number
    pub number: u32,
    /// Encoded article size in bytes
    pub bytes: u64,
    /// Message-id without angle brackets
    pub message_id: String,
}

/// One `<file>` entry
#[derive(Debug, Clone)]
pub struct ParsedFile {
    /// Raw NNTP subject
    pub subject: String,
    /// Poster
    pub poster: String,
    /// Posting date (Unix seconds)
    pub date: i64,
    /// Newsgroups the file was posted to
    pub groups: Vec<String>,
    /// Segments ordered by part number, duplicates removed
    pub segments: Vec<ParsedSegment>,
    /// Duplicate part numbers that carried a different message-id
    pub conflicting_duplicates: u32,
}

impl ParsedFile {
    /// Sum of the segment sizes
    pub fn bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }
}

/// A parsed NZB document
#[derive(Debug, Clone, Default)]
pub struct ParsedNzb {
    /// `<meta type="...">` values from `<head>`, keyed by lower-case type
    pub meta: HashMap<String, Vec<String>>,
    /// Files with at least one valid segment, in document order
    pub files: Vec<ParsedFile>,
    /// Segments dropped because their size was outside (0, 8 MiB)
    pub rejected_segments: u32,
}

impl ParsedNzb {
    /// First value of a meta key
    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Category from `<meta type="category">`
    pub fn category(&self) -> Option<&str> {
        self.meta_value("category")
    }

    /// Password from `<meta type="password">`
    pub fn password(&self) -> Option<&str> {
        self.meta_value("password")
    }

    /// Total size of all valid segments
    pub fn bytes(&self) -> u64 {
        self.files.iter().map(ParsedFile::bytes).sum()
    }
}
