//! Shared helpers for the engine integration tests

#![allow(dead_code)]

pub mod nntp_stub;

use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use usenet_engine::decoder::{PartInfo, encode};
use usenet_engine::{Config, Event, ServerConfig};

pub use nntp_stub::{NntpStub, Script};

/// Upper bound for any single wait on engine events
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// A file as posted: its subject name and the encoded articles
pub struct Posted {
    pub subject_name: String,
    pub data: Vec<u8>,
    pub articles: Vec<(String, Vec<u8>)>,
}

impl Posted {
    /// Split `data` into `segment_size` parts named after `subject_name`
    pub fn new(subject_name: &str, data: Vec<u8>, segment_size: usize) -> Self {
        Self::with_yenc_name(subject_name, subject_name, data, segment_size)
    }

    /// Like [`Posted::new`] but with a different `name=` in the yEnc headers
    pub fn with_yenc_name(
        subject_name: &str,
        yenc_name: &str,
        data: Vec<u8>,
        segment_size: usize,
    ) -> Self {
        let chunks: Vec<&[u8]> = data.chunks(segment_size.max(1)).collect();
        let total = chunks.len() as u32;
        let mut begin = 0u64;
        let articles = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let part = (total > 1).then_some(PartInfo {
                    part: i as u32 + 1,
                    total,
                    begin,
                    file_size: data.len() as u64,
                });
                begin += chunk.len() as u64;
                (message_id(subject_name, i + 1), encode(chunk, yenc_name, part))
            })
            .collect();
        Self {
            subject_name: subject_name.to_string(),
            data,
            articles,
        }
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.articles.iter().map(|(id, _)| id.clone()).collect()
    }
}

pub fn message_id(name: &str, number: usize) -> String {
    format!("{name}.{number}@stub.test")
}

/// Deterministic pseudo-random bytes
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    let mut state = u32::from(seed).wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// NZB XML listing every posted file
pub fn nzb(files: &[&Posted]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n",
    );
    for (i, file) in files.iter().enumerate() {
        xml.push_str(&format!(
            "  <file poster=\"tester@stub.test\" date=\"1700000000\" \
             subject=\"post [{}/{}] - &quot;{}&quot; yEnc (1/{})\">\n    \
             <groups><group>alt.binaries.test</group></groups>\n    <segments>\n",
            i + 1,
            files.len(),
            file.subject_name,
            file.articles.len()
        ));
        for (n, (id, body)) in file.articles.iter().enumerate() {
            xml.push_str(&format!(
                "      <segment bytes=\"{}\" number=\"{}\">{id}</segment>\n",
                body.len(),
                n + 1
            ));
        }
        xml.push_str("    </segments>\n  </file>\n");
    }
    xml.push_str("</nzb>\n");
    xml
}

/// A plain-text server on the local stub port
pub fn stub_server(name: &str, port: u16, priority: u32) -> ServerConfig {
    let mut server = ServerConfig::new(name, "127.0.0.1", port);
    server.priority = priority;
    server.connections = 2;
    server.timeout = Duration::from_secs(5);
    server
}

/// Engine config rooted in `dir` without external tools
pub fn config(dir: &Path, servers: Vec<ServerConfig>) -> Config {
    let mut config = Config {
        servers,
        ..Default::default()
    };
    config.download.download_dir = dir.join("incomplete");
    config.download.complete_dir = dir.join("complete");
    config.persistence.admin_dir = dir.join("admin");
    config.persistence.database_path = dir.join("history.db");
    config.tools.search_path = false;
    config.tools.unrar_path = None;
    config
}

/// Wait for the first event matching `pred`, recording everything seen
pub async fn wait_for(
    events: &mut broadcast::Receiver<Event>,
    seen: &mut Vec<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    let waited = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    seen.push(event.clone());
                    if pred(&event) {
                        return event;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    match waited {
        Ok(event) => event,
        Err(_) => panic!("timed out waiting for an event; seen: {seen:#?}"),
    }
}

/// Wait until the job reaches `Complete` or `Failed`
pub async fn wait_for_outcome(
    events: &mut broadcast::Receiver<Event>,
    seen: &mut Vec<Event>,
) -> Event {
    wait_for(events, seen, |e| {
        matches!(e, Event::Complete { .. } | Event::Failed { .. })
    })
    .await
}

/// A PAR2 File Description packet for `name` whose contents are `data`
pub fn par2_file_desc(name: &str, data: &[u8]) -> Vec<u8> {
    let hash16k = md5::compute(&data[..data.len().min(16 * 1024)]).0;
    let mut body = Vec::new();
    body.extend_from_slice(&[0x11; 16]);
    body.extend_from_slice(&md5::compute(data).0);
    body.extend_from_slice(&hash16k);
    body.extend_from_slice(&(data.len() as u64).to_le_bytes());
    body.extend_from_slice(name.as_bytes());
    body.resize(56 + ((name.len() + 3) & !3), 0);

    let mut packet = Vec::with_capacity(64 + body.len());
    packet.extend_from_slice(b"PAR2\0PKT");
    packet.extend_from_slice(&((64 + body.len()) as u64).to_le_bytes());
    packet.extend_from_slice(&md5::compute(&body).0);
    packet.extend_from_slice(&[0x22; 16]);
    packet.extend_from_slice(b"PAR 2.0\0FileDesc");
    packet.extend_from_slice(&body);
    packet
}
