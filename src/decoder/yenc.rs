//! yEnc decoding of NNTP article bodies
//!
//! The input is the article as received after the status line: CRLF
//! separated lines, still dot-stuffed, optionally preceded by headers (when
//! `ARTICLE` was used instead of `BODY`) and optionally ending in the
//! terminating `.` line.

use crate::error::DecodeError;

/// One decoded yEnc part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YencPart {
    /// Decoded payload
    pub data: Vec<u8>,
    /// `name=` from `=ybegin` (not authoritative; may be obfuscated)
    pub name: Option<String>,
    /// Full file size from `=ybegin size=`
    pub file_size: Option<u64>,
    /// `part=` from `=ybegin`
    pub part: Option<u32>,
    /// Zero-based file offset of this part (`=ypart begin=` minus one)
    pub begin: Option<u64>,
    /// CRC32 of `data`
    pub crc32: u32,
    /// Whole-file CRC32 announced by a multi-part trailer (`crc32=`)
    pub file_crc32: Option<u32>,
}

/// Value of `key=` on a yEnc control line
///
/// `name` runs to the end of the line; every other value ends at a space.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut search = 0;
    while let Some(pos) = line[search..].find(key) {
        let at = search + pos;
        let preceded = at == 0 || line.as_bytes()[at - 1] == b' ';
        let value_start = at + key.len();
        if preceded && line.as_bytes().get(value_start) == Some(&b'=') {
            let rest = &line[value_start + 1..];
            if key == "name" {
                return Some(rest.trim_end());
            }
            return Some(rest.split(' ').next().unwrap_or(""));
        }
        search = value_start;
    }
    None
}

fn num_field(line: &str, key: &'static str) -> Result<Option<u64>, DecodeError> {
    field(line, key)
        .map(|v| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| DecodeError::MalformedField { field: key })
        })
        .transpose()
}

fn crc_field(line: &str, key: &'static str) -> Result<Option<u32>, DecodeError> {
    field(line, key)
        .map(|v| {
            let v = v.trim();
            // some posters emit fewer than eight digits or a 0x prefix
            let v = v.strip_prefix("0x").unwrap_or(v);
            u32::from_str_radix(v, 16).map_err(|_| DecodeError::MalformedField { field: key })
        })
        .transpose()
}

/// Split on `\n`, dropping a trailing `\r`
fn lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == b'\n')
        .map(|l| l.strip_suffix(b"\r").unwrap_or(l))
}

/// Decode one yEnc article body
///
/// Headers before `=ybegin` are skipped. The decoded length must equal
/// `=yend size=`, and the decoded CRC must equal `pcrc32=` (or `crc32=` for
/// single-part posts) when present.
pub fn decode(raw: &[u8]) -> Result<YencPart, DecodeError> {
    let mut lines = lines(raw);

    let begin_line = lines
        .by_ref()
        .find(|l| l.starts_with(b"=ybegin "))
        .ok_or(DecodeError::MissingHeader)?;
    let begin_line = String::from_utf8_lossy(begin_line).into_owned();
    let file_size = num_field(&begin_line, "size")?;
    let part = num_field(&begin_line, "part")?.map(|p| p as u32);
    let name = field(&begin_line, "name").map(str::to_string);

    let mut data = Vec::with_capacity(file_size.unwrap_or(0).min(1 << 20) as usize);
    let mut begin = None;
    let mut trailer = None;
    let mut first = true;

    for line in lines {
        if first {
            first = false;
            if line.starts_with(b"=ypart ") {
                let text = String::from_utf8_lossy(line);
                begin = num_field(&text, "begin")?.map(|b| b.saturating_sub(1));
                continue;
            }
        }
        if line.starts_with(b"=yend") {
            trailer = Some(String::from_utf8_lossy(line).into_owned());
            break;
        }
        // undo NNTP dot-stuffing
        let line = if line.starts_with(b"..") {
            &line[1..]
        } else {
            line
        };
        decode_line(line, &mut data);
    }

    let trailer = trailer.ok_or(DecodeError::MissingTrailer)?;
    let crc32 = crc32fast::hash(&data);

    if let Some(expected) = num_field(&trailer, "size")?
        && expected != data.len() as u64
    {
        return Err(DecodeError::SizeMismatch {
            expected,
            actual: data.len() as u64,
        });
    }

    let pcrc = crc_field(&trailer, "pcrc32")?;
    let full = crc_field(&trailer, "crc32")?;
    let multipart = part.is_some() || begin.is_some();
    let part_crc = if multipart { pcrc } else { pcrc.or(full) };
    if let Some(expected) = part_crc
        && expected != crc32
    {
        return Err(DecodeError::CrcMismatch {
            expected,
            actual: crc32,
        });
    }

    Ok(YencPart {
        data,
        name,
        file_size,
        part,
        begin: begin.or(if multipart { None } else { Some(0) }),
        crc32,
        file_crc32: if multipart { full } else { Some(crc32) },
    })
}

fn decode_line(line: &[u8], out: &mut Vec<u8>) {
    let mut escaped = false;
    for &b in line {
        if escaped {
            out.push(b.wrapping_sub(64).wrapping_sub(42));
            escaped = false;
        } else if b == b'=' {
            escaped = true;
        } else {
            out.push(b.wrapping_sub(42));
        }
    }
}

/// Multi-part coordinates for [`encode`]
#[derive(Debug, Clone, Copy)]
pub struct PartInfo {
    /// 1-based part number
    pub part: u32,
    /// Total number of parts
    pub total: u32,
    /// Zero-based offset of the part in the file
    pub begin: u64,
    /// Size of the whole file
    pub file_size: u64,
}

/// Encode `data` as a yEnc body with 128-character lines
///
/// The output contains no line starting with `.`, so it needs no
/// dot-stuffing on the wire.
pub fn encode(data: &[u8], name: &str, part: Option<PartInfo>) -> Vec<u8> {
    const LINE: usize = 128;
    let mut out = Vec::with_capacity(data.len() + data.len() / 50 + 256);
    let crc = crc32fast::hash(data);

    match part {
        Some(p) => {
            out.extend_from_slice(
                format!(
                    "=ybegin part={} total={} line={LINE} size={} name={name}\r\n",
                    p.part, p.total, p.file_size
                )
                .as_bytes(),
            );
            out.extend_from_slice(
                format!("=ypart begin={} end={}\r\n", p.begin + 1, p.begin + data.len() as u64)
                    .as_bytes(),
            );
        }
        None => out.extend_from_slice(
            format!("=ybegin line={LINE} size={} name={name}\r\n", data.len()).as_bytes(),
        ),
    }

    let mut col = 0;
    for &b in data {
        let e = b.wrapping_add(42);
        let critical = matches!(e, 0 | b'\n' | b'\r' | b'=')
            || (col == 0 && matches!(e, b'.' | b' ' | b'\t'));
        if critical {
            out.push(b'=');
            out.push(e.wrapping_add(64));
            col += 2;
        } else {
            out.push(e);
            col += 1;
        }
        if col >= LINE {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }

    let trailer = match part {
        Some(p) => format!(
            "=yend size={} part={} pcrc32={crc:08x}\r\n",
            data.len(),
            p.part
        ),
        None => format!("=yend size={} crc32={crc:08x}\r\n", data.len()),
    };
    out.extend_from_slice(trailer.as_bytes());
    out
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn every_byte() -> Vec<u8> {
        (0..=255u8).cycle().take(1000).collect()
    }

    #[test]
    fn single_part_round_trip() {
        let data = every_byte();
        let encoded = encode(&data, "test.bin", None);
        let part = decode(&encoded).unwrap();
        assert_eq!(part.data, data);
        assert_eq!(part.name.as_deref(), Some("test.bin"));
        assert_eq!(part.begin, Some(0), "single part starts at zero");
        assert_eq!(part.file_crc32, Some(crc32fast::hash(&data)));
    }

    #[test]
    fn multipart_header_gives_offset() {
        let data = every_byte();
        let encoded = encode(
            &data[500..],
            "My File (1).bin",
            Some(PartInfo {
                part: 2,
                total: 2,
                begin: 500,
                file_size: 1000,
            }),
        );
        let part = decode(&encoded).unwrap();
        assert_eq!(part.begin, Some(500));
        assert_eq!(part.part, Some(2));
        assert_eq!(part.file_size, Some(1000));
        assert_eq!(part.name.as_deref(), Some("My File (1).bin"), "name keeps spaces");
        assert_eq!(part.crc32, crc32fast::hash(&data[500..]));
    }

    #[test]
    fn headers_and_dot_stuffing_are_handled() {
        // '.' is encoded from 4; a line starting with ".." is a stuffed "."
        let body = b"Subject: x\r\nMessage-ID: <a@b>\r\n\r\n=ybegin line=128 size=2 name=a\r\n..\x6b\r\n=yend size=2\r\n.\r\n";
        let part = decode(body).unwrap();
        assert_eq!(part.data, vec![4, 65]);
    }

    #[test]
    fn corrupt_articles_are_rejected() {
        let data = every_byte();
        let mut encoded = encode(&data, "a", None);
        assert_eq!(decode(b"no yenc here\r\n"), Err(DecodeError::MissingHeader));

        let cut = encoded.len() - 30;
        assert_eq!(
            decode(&encoded[..cut]),
            Err(DecodeError::MissingTrailer),
            "truncated article"
        );

        // flip one payload byte: CRC must catch it
        let pos = encoded.iter().position(|&b| b == b'\n').unwrap() + 10;
        encoded[pos] = encoded[pos].wrapping_add(1);
        assert!(matches!(decode(&encoded), Err(DecodeError::CrcMismatch { .. })));
    }

    #[test]
    fn size_mismatch_is_reported() {
        let body = b"=ybegin line=128 size=3 name=a\r\nklm\r\n=yend size=4\r\n";
        assert_eq!(
            decode(body),
            Err(DecodeError::SizeMismatch {
                expected: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn field_lookup_requires_word_boundary() {
        let line = "=yend size=10 part=1 pcrc32=0000abcd crc32=12345678";
        assert_eq!(field(line, "crc32"), Some("12345678"));
        assert_eq!(field(line, "pcrc32"), Some("0000abcd"));
        assert_eq!(field(line, "begin"), None);
    }
}
