//! yEnc decoding, CRC32 combination and the decoder workers
//!
//! The workers turn what a connection delivered into job state: decoded
//! payloads go to the article cache and the assembler, failures go through
//! the fail-over search, and every resolution is registered on the job.

mod crc32;
mod worker;
mod yenc;

pub use crc32::{CrcTracker, crc32_combine};
pub(crate) use worker::{DecodeRequest, spawn_workers};
pub use yenc::{PartInfo, YencPart, decode, encode};
