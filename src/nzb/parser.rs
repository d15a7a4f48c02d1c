//! Streaming NZB XML parser

use std::collections::BTreeMap;
use std::io::BufRead;

use flate2::read::GzDecoder;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, warn};

use super::{ParsedFile, ParsedNzb, ParsedSegment};
use crate::error::{Error, Result};

/// Segments at or above this size are rejected as malformed
pub const MAX_SEGMENT_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug)]
enum ParseState {
    Initial,
    InNzb,
    InHead,
    InMeta(String),
    InFile,
    InGroups,
    InGroup,
    InSegments,
    InSegment { bytes: u64, number: u32 },
}

#[derive(Debug)]
struct FileBuilder {
    subject: String,
    poster: String,
    date: i64,
    groups: Vec<String>,
    // keyed by part number so duplicates and ordering are handled at insert
    segments: BTreeMap<u32, ParsedSegment>,
    conflicting_duplicates: u32,
}

struct NzbParser {
    state: ParseState,
    result: ParsedNzb,
    current_file: Option<FileBuilder>,
    current_text: String,
    saw_root: bool,
}

impl NzbParser {
    fn new() -> Self {
        Self {
            state: ParseState::Initial,
            result: ParsedNzb::default(),
            current_file: None,
            current_text: String::new(),
            saw_root: false,
        }
    }

    fn parse<R: BufRead>(mut self, input: R) -> Result<ParsedNzb> {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::with_capacity(4096);

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => self.handle_start(e)?,
                Ok(Event::Empty(ref e)) => {
                    self.handle_start(e)?;
                    self.handle_end(e.local_name().as_ref())?;
                }
                Ok(Event::End(ref e)) => self.handle_end(e.local_name().as_ref())?,
                Ok(Event::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map_err(|e| Error::InvalidNzb(format!("bad text: {e}")))?;
                    self.current_text.push_str(&text);
                }
                Ok(Event::CData(ref e)) => {
                    self.current_text
                        .push_str(&String::from_utf8_lossy(e.as_ref()));
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(Error::InvalidNzb(format!(
                        "XML error at byte {}: {e}",
                        reader.buffer_position()
                    )));
                }
            }
            buf.clear();
        }

        if !self.saw_root {
            return Err(Error::InvalidNzb("missing <nzb> root element".into()));
        }
        if self.result.files.is_empty() {
            return Err(Error::InvalidNzb("NZB contains no usable files".into()));
        }

        debug!(
            files = self.result.files.len(),
            rejected_segments = self.result.rejected_segments,
            "parsed NZB"
        );
        Ok(self.result)
    }

    fn handle_start(&mut self, e: &BytesStart) -> Result<()> {
        self.current_text.clear();
        let name = e.local_name();

        self.state = match (&self.state, name.as_ref()) {
            (ParseState::Initial, b"nzb") => {
                self.saw_root = true;
                ParseState::InNzb
            }
            (ParseState::InNzb, b"head") => ParseState::InHead,
            (ParseState::InHead, b"meta") => {
                let key = get_attr(e, b"type")?.unwrap_or_default().to_lowercase();
                ParseState::InMeta(key)
            }
            (ParseState::InNzb, b"file") => {
                self.current_file = Some(FileBuilder {
                    subject: get_attr(e, b"subject")?.unwrap_or_default(),
                    poster: get_attr(e, b"poster")?.unwrap_or_default(),
                    date: get_attr(e, b"date")?
                        .and_then(|s| s.trim().parse::<i64>().ok())
                        .unwrap_or(0),
                    groups: Vec::new(),
                    segments: BTreeMap::new(),
                    conflicting_duplicates: 0,
                });
                ParseState::InFile
            }
            (ParseState::InFile, b"groups") => ParseState::InGroups,
            (ParseState::InGroups, b"group") => ParseState::InGroup,
            (ParseState::InFile, b"segments") => ParseState::InSegments,
            (ParseState::InSegments, b"segment") => {
                let bytes = get_attr(e, b"bytes")?
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .unwrap_or(0);
                let number = get_attr(e, b"number")?
                    .and_then(|s| s.trim().parse::<u32>().ok())
                    .ok_or_else(|| {
                        Error::InvalidNzb("segment without a valid number attribute".into())
                    })?;
                ParseState::InSegment { bytes, number }
            }
            _ => return Ok(()),
        };
        Ok(())
    }

    fn handle_end(&mut self, tag: &[u8]) -> Result<()> {
        self.state = match (&self.state, tag) {
            (ParseState::InMeta(key), b"meta") => {
                let value = std::mem::take(&mut self.current_text).trim().to_string();
                self.result.meta.entry(key.clone()).or_default().push(value);
                ParseState::InHead
            }
            (ParseState::InHead, b"head") => ParseState::InNzb,
            (ParseState::InGroup, b"group") => {
                if let Some(file) = self.current_file.as_mut() {
                    let group = std::mem::take(&mut self.current_text).trim().to_string();
                    if !group.is_empty() {
                        file.groups.push(group);
                    }
                }
                ParseState::InGroups
            }
            (ParseState::InGroups, b"groups") => ParseState::InFile,
            (ParseState::InSegment { bytes, number }, b"segment") => {
                let (bytes, number) = (*bytes, *number);
                let raw = std::mem::take(&mut self.current_text);
                self.add_segment(bytes, number, &raw);
                ParseState::InSegments
            }
            (ParseState::InSegments, b"segments") => ParseState::InFile,
            (ParseState::InFile, b"file") => {
                if let Some(builder) = self.current_file.take() {
                    self.finish_file(builder);
                }
                ParseState::InNzb
            }
            (ParseState::InNzb, b"nzb") => ParseState::Initial,
            _ => return Ok(()),
        };
        Ok(())
    }

    fn add_segment(&mut self, bytes: u64, number: u32, raw_id: &str) {
        let Some(file) = self.current_file.as_mut() else {
            return;
        };

        let message_id = raw_id
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string();
        if message_id.is_empty() {
            warn!(subject = %file.subject, number, "skipping segment without message-id");
            return;
        }

        if bytes == 0 || bytes >= MAX_SEGMENT_BYTES {
            warn!(
                subject = %file.subject,
                number,
                bytes,
                "rejecting segment with invalid size"
            );
            self.result.rejected_segments += 1;
            return;
        }

        match file.segments.get(&number) {
            Some(existing) if existing.message_id != message_id => {
                warn!(
                    subject = %file.subject,
                    number,
                    kept = %existing.message_id,
                    dropped = %message_id,
                    "duplicate part number with different message-id"
                );
                file.conflicting_duplicates += 1;
            }
            Some(_) => {}
            None => {
                file.segments.insert(
                    number,
                    ParsedSegment {
                        number,
                        bytes,
                        message_id,
                    },
                );
            }
        }
    }

    fn finish_file(&mut self, builder: FileBuilder) {
        if builder.segments.is_empty() {
            warn!(subject = %builder.subject, "skipping file without valid segments");
            return;
        }
        self.result.files.push(ParsedFile {
            subject: builder.subject,
            poster: builder.poster,
            date: builder.date,
            groups: builder.groups,
            segments: builder.segments.into_values().collect(),
            conflicting_duplicates: builder.conflicting_duplicates,
        });
    }
}

fn get_attr(e: &BytesStart, name: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == name {
            let value = attr
                .unescape_value()
                .map_err(|e| Error::InvalidNzb(format!("bad attribute value: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

/// Parse an uncompressed NZB document
pub fn parse_nzb(data: &[u8]) -> Result<ParsedNzb> {
    NzbParser::new().parse(std::io::BufReader::new(data))
}

/// Parse an NZB document, transparently decompressing gzip input
pub fn parse_nzb_auto(data: &[u8]) -> Result<ParsedNzb> {
    let is_gzip = data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b;
    if is_gzip {
        let reader = std::io::BufReader::new(GzDecoder::new(data));
        NzbParser::new().parse(reader)
    } else {
        parse_nzb(data)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="category">TV</meta>
    <meta type="password">s3cret</meta>
  </head>
  <file poster="poster@example.com" date="1700000000" subject="Show [1/2] - &quot;show.part1.rar&quot; yEnc (1/2)">
    <groups><group>alt.binaries.test</group></groups>
    <segments>
      <segment bytes="102400" number="2">part2@example.com</segment>
      <segment bytes="102400" number="1">&lt;part1@example.com&gt;</segment>
    </segments>
  </file>
  <file poster="poster@example.com" date="1700000100" subject="Show [2/2] - &quot;show.par2&quot; yEnc (1/1)">
    <groups><group>alt.binaries.test</group></groups>
    <segments>
      <segment bytes="51200" number="1">par@example.com</segment>
    </segments>
  </file>
</nzb>"#;

    #[test]
    fn parses_files_segments_and_meta() {
        let nzb = parse_nzb(SAMPLE.as_bytes()).unwrap();

        assert_eq!(nzb.category(), Some("TV"));
        assert_eq!(nzb.password(), Some("s3cret"));
        assert_eq!(nzb.files.len(), 2);

        let first = &nzb.files[0];
        assert_eq!(first.date, 1_700_000_000);
        assert_eq!(first.groups, vec!["alt.binaries.test".to_string()]);
        assert_eq!(
            first
                .segments
                .iter()
                .map(|s| s.number)
                .collect::<Vec<_>>(),
            vec![1, 2],
            "segments are ordered by part number"
        );
        assert_eq!(
            first.segments[0].message_id, "part1@example.com",
            "angle brackets are stripped"
        );
        assert_eq!(nzb.bytes(), 102_400 * 2 + 51_200);
    }

    #[test]
    fn rejects_zero_and_oversized_segments() {
        let xml = format!(
            r#"<nzb><file subject="x" date="1"><groups><group>a.b</group></groups><segments>
                <segment bytes="0" number="1">zero@x</segment>
                <segment bytes="{}" number="2">huge@x</segment>
                <segment bytes="1000" number="3">ok@x</segment>
            </segments></file></nzb>"#,
            MAX_SEGMENT_BYTES
        );
        let nzb = parse_nzb(xml.as_bytes()).unwrap();
        assert_eq!(nzb.rejected_segments, 2);
        assert_eq!(nzb.files[0].segments.len(), 1);
        assert_eq!(nzb.bytes(), 1000, "rejected segments are not counted");
    }

    #[test]
    fn duplicate_part_numbers_keep_the_first() {
        let xml = r#"<nzb><file subject="x" date="1"><groups><group>a.b</group></groups><segments>
                <segment bytes="100" number="1">first@x</segment>
                <segment bytes="100" number="1">first@x</segment>
                <segment bytes="100" number="1">other@x</segment>
            </segments></file></nzb>"#;
        let nzb = parse_nzb(xml.as_bytes()).unwrap();
        let file = &nzb.files[0];
        assert_eq!(file.segments.len(), 1);
        assert_eq!(file.segments[0].message_id, "first@x");
        assert_eq!(
            file.conflicting_duplicates, 1,
            "only the differing message-id counts as a conflict"
        );
    }

    #[test]
    fn empty_or_rootless_documents_are_invalid() {
        assert!(matches!(
            parse_nzb(b"<nzb></nzb>"),
            Err(Error::InvalidNzb(_))
        ));
        assert!(matches!(
            parse_nzb(b"<html><body/></html>"),
            Err(Error::InvalidNzb(_))
        ));
        assert!(matches!(
            parse_nzb(b"<nzb><file subject=\"x\"><segments></segments></file></nzb>"),
            Err(Error::InvalidNzb(_))
        ));
    }

    #[test]
    fn gzip_input_is_detected() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let nzb = parse_nzb_auto(&compressed).unwrap();
        assert_eq!(nzb.files.len(), 2);
    }
}
