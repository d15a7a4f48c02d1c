//! Builders shared by the unit tests of the job, queue and pipeline modules

use std::path::Path;

use super::NzbObject;
use crate::config::{Config, ServerConfig};
use crate::nzb::{ParsedFile, ParsedNzb, ParsedSegment};
use crate::server::ServerInfo;
use crate::types::{JobOptions, ServerId};

/// A file whose subject quotes `name`, with `segments` parts of `size` bytes
pub(crate) fn parsed_file(name: &str, segments: u32, size: u64) -> ParsedFile {
    ParsedFile {
        subject: format!("post [1/1] - \"{name}\" yEnc (1/{segments})"),
        poster: "poster@example.com".into(),
        date: 1_700_000_000,
        groups: vec!["alt.binaries.test".into()],
        segments: (1..=segments)
            .map(|n| ParsedSegment {
                number: n,
                bytes: size,
                message_id: format!("{name}.{n}@test"),
            })
            .collect(),
        conflicting_duplicates: 0,
    }
}

/// An NZB with one file per `(name, segments, size)` entry
pub(crate) fn parsed_nzb(files: &[(&str, u32, u64)]) -> ParsedNzb {
    ParsedNzb {
        files: files
            .iter()
            .map(|(name, segments, size)| parsed_file(name, *segments, *size))
            .collect(),
        ..Default::default()
    }
}

/// Config with one server per priority in `priorities`, rooted in `dir`
pub(crate) fn test_config(dir: &Path, priorities: &[u32]) -> Config {
    let mut config = Config::default();
    config.download.download_dir = dir.join("incomplete");
    config.download.complete_dir = dir.join("complete");
    config.persistence.admin_dir = dir.join("admin");
    config.persistence.database_path = dir.join("history.db");
    config.servers = priorities
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let mut server = ServerConfig::new(format!("server{i}"), "127.0.0.1", 119);
            server.priority = *p;
            server.connections = 1;
            server
        })
        .collect();
    config
}

/// Server views matching [`test_config`]
pub(crate) fn server_infos(priorities: &[u32]) -> Vec<ServerInfo> {
    priorities
        .iter()
        .enumerate()
        .map(|(i, p)| ServerInfo::new(ServerId(i as u16), *p, true))
        .collect()
}

/// A job built from `files` with default options
pub(crate) fn job(config: &Config, files: &[(&str, u32, u64)]) -> NzbObject {
    NzbObject::from_parsed(
        parsed_nzb(files),
        "Test.Job.nzb",
        &JobOptions::default(),
        false,
        config,
    )
    .expect("valid job")
}
