//! PAR2 support: packet parsing, par2 tool output parsing and the
//! [`ParityHandler`] abstraction used by post-processing
//!
//! Only the metadata packets are read in-process (File Description and
//! Main). Verification and repair go through an external `par2` binary.

mod handler;
mod output;
mod packets;

pub use handler::{CliParityHandler, NoOpParityHandler, ParityHandler, RepairResult, VerifyResult};
pub use output::{ExitStatus, parse_repair_output, parse_verify_output};
pub use packets::{Par2Pack, compute_16k_md5, parse_par2_file, parse_par2_packets};

use serde::{Deserialize, Serialize};

/// One file described by a par2 set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Par2FileInfo {
    /// MD5 of the whole file
    pub hash: [u8; 16],
    /// MD5 of the first 16 KiB
    pub hash16k: [u8; 16],
    /// File length in bytes
    pub size: u64,
}

/// Ratcliff/Obershelp similarity of two strings in `0.0..=1.0`
///
/// Twice the number of matching characters divided by the total length,
/// where matches are found by recursively taking the longest common block.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f64 / total as f64
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (start_a, start_b, len) = longest_common_block(a, b);
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..start_a], &b[..start_b])
        + matching_chars(&a[start_a + len..], &b[start_b + len..])
}

/// `(start in a, start in b, length)` of the longest common substring
fn longest_common_block(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        for (j, cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb { prev[j] + 1 } else { 0 };
            if row[j + 1] > best.2 {
                best = (i + 1 - row[j + 1], j + 1 - row[j + 1], row[j + 1]);
            }
        }
        std::mem::swap(&mut prev, &mut row);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_of_identical_and_disjoint_strings() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        assert_eq!(similarity("", ""), 1.0);
    }

    #[test]
    fn similarity_matches_ratcliff_obershelp() {
        // blocks "WIKIM" and "IA"
        let ratio = similarity("WIKIMEDIA", "WIKIMANIA");
        assert!((ratio - 2.0 * 7.0 / 18.0).abs() < 1e-9, "got {ratio}");

        assert!(similarity("Some.Release", "Some.Release1") >= 0.85);
        assert!(similarity("Some.Release", "Other") < 0.85);
    }
}
