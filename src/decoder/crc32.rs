//! CRC32 combination over concatenated byte ranges
//!
//! Segments of a file are decoded in arbitrary order, each with its own
//! CRC32. [`crc32_combine`] joins `crc(A)` and `crc(B)` into `crc(A ∥ B)`
//! knowing only `len(B)`, by multiplying `crc(A)` with `x^(8·len(B))` modulo
//! the CRC polynomial in GF(2). [`CrcTracker`] folds segment CRCs into a
//! running file CRC as soon as the contiguous prefix grows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Reflected CRC-32 (IEEE 802.3) polynomial
const POLY: u32 = 0xedb8_8320;

/// `X2N_TABLE[n] = x^(2^n) mod p(x)`
const X2N_TABLE: [u32; 32] = build_x2n_table();

/// Multiply `a` and `b` modulo the CRC polynomial (reflected bit order)
const fn multmodp(a: u32, mut b: u32) -> u32 {
    let mut m: u32 = 1 << 31;
    let mut p: u32 = 0;
    loop {
        if a & m != 0 {
            p ^= b;
            if a & (m - 1) == 0 {
                break;
            }
        }
        m >>= 1;
        b = if b & 1 != 0 { (b >> 1) ^ POLY } else { b >> 1 };
    }
    p
}

const fn build_x2n_table() -> [u32; 32] {
    let mut table = [0u32; 32];
    // x^1
    let mut p: u32 = 1 << 30;
    table[0] = p;
    let mut n = 1;
    while n < 32 {
        p = multmodp(p, p);
        table[n] = p;
        n += 1;
    }
    table
}

/// `x^(n·2^k) mod p(x)`
fn x2nmodp(mut n: u64, mut k: usize) -> u32 {
    let mut p: u32 = 1 << 31;
    while n != 0 {
        if n & 1 != 0 {
            p = multmodp(X2N_TABLE[k & 31], p);
        }
        n >>= 1;
        k += 1;
    }
    p
}

/// Combine `crc1 = crc(A)` and `crc2 = crc(B)` into `crc(A ∥ B)`
///
/// # Examples
///
/// ```
/// use usenet_engine::decoder::crc32_combine;
///
/// let data = b"hello, world";
/// let (a, b) = data.split_at(5);
/// let combined = crc32_combine(crc32fast::hash(a), crc32fast::hash(b), b.len() as u64);
/// assert_eq!(combined, crc32fast::hash(data));
/// ```
pub fn crc32_combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    multmodp(x2nmodp(len2, 3), crc1) ^ crc2
}

/// Running CRC32 of a file assembled from out-of-order segments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrcTracker {
    /// Segments that arrived ahead of the contiguous prefix
    pending: BTreeMap<u32, (u32, u64)>,
    /// Index of the first segment not folded in yet
    next: u32,
    /// CRC of the contiguous prefix
    crc: u32,
    /// Length of the contiguous prefix
    len: u64,
}

impl CrcTracker {
    /// Record the CRC and decoded length of segment `index`
    pub fn add(&mut self, index: u32, crc: u32, len: u64) {
        if index < self.next {
            return;
        }
        self.pending.insert(index, (crc, len));
        while let Some((crc, len)) = self.pending.remove(&self.next) {
            self.crc = crc32_combine(self.crc, crc, len);
            self.len += len;
            self.next += 1;
        }
    }

    /// Number of leading segments folded into [`Self::crc`]
    pub fn covered(&self) -> u32 {
        self.next
    }

    /// CRC of the contiguous prefix
    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Length of the contiguous prefix
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no segment has been folded in yet
    pub fn is_empty(&self) -> bool {
        self.next == 0
    }
}
