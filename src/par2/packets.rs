//! In-process reader for PAR2 metadata packets
//!
//! Every packet starts with a 64 byte header:
//! - 8 bytes: magic `PAR2\0PKT`
//! - 8 bytes: packet length (little-endian, header included)
//! - 16 bytes: MD5 of the packet body
//! - 16 bytes: recovery set id
//! - 16 bytes: packet type
//!
//! File Description bodies hold the file id, the MD5 of the whole file, the
//! MD5 of its first 16 KiB, the file length and the null-padded filename.
//! Recovery slices and every other packet type are skipped.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use super::Par2FileInfo;
use crate::error::Result;

const PAR2_MAGIC: &[u8; 8] = b"PAR2\0PKT";
const FILE_DESC_TYPE: &[u8; 16] = b"PAR 2.0\0FileDesc";
const MAIN_TYPE: &[u8; 16] = b"PAR 2.0\0Main\0\0\0\0";

const HEADER_SIZE: usize = 64;
const SET_ID_OFFSET: usize = 32;
const TYPE_OFFSET: usize = 48;

/// file_id + md5 + md5_16k + length
const FILE_DESC_FIXED_BODY: usize = 56;

/// Metadata of one par2 file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Par2Pack {
    /// Recovery set id from the Main packet
    pub set_id: Option<[u8; 16]>,
    /// Described files keyed by filename
    pub files: HashMap<String, Par2FileInfo>,
}

/// Read the metadata packets of a par2 file on disk
pub fn parse_par2_file(path: &Path) -> Result<Par2Pack> {
    let data = std::fs::read(path)?;
    Ok(parse_par2_packets(&data))
}

/// Read the metadata packets from raw par2 bytes
///
/// Damaged packets are skipped by resynchronising on the next magic.
pub fn parse_par2_packets(data: &[u8]) -> Par2Pack {
    let mut pack = Par2Pack::default();
    let mut pos = 0;

    while let Some(start) = find_magic(data, pos) {
        pos = start;
        if pos + HEADER_SIZE > data.len() {
            break;
        }
        let len = read_u64(&data[pos + 8..pos + 16]) as usize;
        if len < HEADER_SIZE || len % 4 != 0 || pos.saturating_add(len) > data.len() {
            pos += PAR2_MAGIC.len();
            continue;
        }

        let kind = &data[pos + TYPE_OFFSET..pos + TYPE_OFFSET + 16];
        let body = &data[pos + HEADER_SIZE..pos + len];
        if kind == FILE_DESC_TYPE {
            if let Some((name, info)) = file_description(body) {
                pack.files.entry(name).or_insert(info);
            }
        } else if kind == MAIN_TYPE && pack.set_id.is_none() {
            let mut id = [0u8; 16];
            id.copy_from_slice(&data[pos + SET_ID_OFFSET..pos + SET_ID_OFFSET + 16]);
            pack.set_id = Some(id);
        }
        pos += len;
    }
    pack
}

fn file_description(body: &[u8]) -> Option<(String, Par2FileInfo)> {
    if body.len() <= FILE_DESC_FIXED_BODY {
        return None;
    }
    let mut hash = [0u8; 16];
    hash.copy_from_slice(&body[16..32]);
    let mut hash16k = [0u8; 16];
    hash16k.copy_from_slice(&body[32..48]);
    let size = read_u64(&body[48..56]);

    let raw = &body[FILE_DESC_FIXED_BODY..];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let name = String::from_utf8_lossy(&raw[..end]).trim().to_string();
    if name.is_empty() {
        return None;
    }
    Some((name, Par2FileInfo { hash, hash16k, size }))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn find_magic(data: &[u8], start: usize) -> Option<usize> {
    if start + PAR2_MAGIC.len() > data.len() {
        return None;
    }
    data[start..]
        .windows(PAR2_MAGIC.len())
        .position(|w| w == PAR2_MAGIC)
        .map(|offset| start + offset)
}

/// MD5 of the first 16 KiB of a file
pub fn compute_16k_md5(path: &Path) -> Result<[u8; 16]> {
    let mut file = std::fs::File::open(path)?;
    let mut buffer = Vec::with_capacity(16 * 1024);
    file.by_ref().take(16 * 1024).read_to_end(&mut buffer)?;
    Ok(md5::compute(&buffer).0)
}
