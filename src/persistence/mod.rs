//! On-disk state
//!
//! Queue-wide state lives in `queue.sab` inside the configured admin
//! directory. Everything about one job lives in the job's own admin
//! directory (`<incomplete>/<job name>/__ADMIN__`), see [`job`].
//!
//! All files are written to a temporary name first and renamed into place,
//! so a crash never leaves a half-written file behind.

mod job;

pub use job::{
    ATTRIB_FILE, JobAttributes, RENAMES_FILE, VERIFIED_FILE, find_nzb_backup, load_article_table,
    load_attributes, load_job, load_renames, load_verified, purge_admin, save_article_table,
    save_attributes, save_job, save_nzb_backup, save_renames, save_verified,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{HistoryEntry, JobId};

/// Name of the admin directory inside a job directory
pub const ADMIN_DIR: &str = "__ADMIN__";

/// Name of the queue file inside the admin directory
pub const QUEUE_FILE: &str = "queue.sab";

/// Version written to (and expected in) `queue.sab`
pub const QUEUE_VERSION: u32 = 1;

/// Where a queued job's snapshot can be found
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    /// Job id (names the snapshot file)
    pub id: JobId,
    /// Job directory below the incomplete root
    pub folder: String,
}

impl JobRef {
    /// Admin directory of the job below `download_dir`
    pub fn admin_path(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(&self.folder).join(ADMIN_DIR)
    }
}

/// Contents of `queue.sab`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueFile {
    /// Format version
    pub version: u32,
    /// Queued jobs in queue order
    pub jobs: Vec<JobRef>,
    /// Jobs that were waiting in or running post-processing
    #[serde(default)]
    pub postproc: Vec<JobRef>,
    /// Most recent history records
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl QueueFile {
    /// A current-version file
    pub fn new(jobs: Vec<JobRef>, postproc: Vec<JobRef>, history: Vec<HistoryEntry>) -> Self {
        Self {
            version: QUEUE_VERSION,
            jobs,
            postproc,
            history,
        }
    }
}

/// Write `data` to `path` through a temporary file
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data).await.map_err(|e| {
        if crate::error::is_disk_full_io(&e) {
            Error::DiskFull {
                path: path.to_path_buf(),
            }
        } else {
            Error::Io(e)
        }
    })?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Write `queue.sab` into `admin_dir`
pub async fn save_queue(admin_dir: &Path, queue: &QueueFile) -> Result<()> {
    let data = serde_json::to_vec_pretty(queue)?;
    write_atomic(&admin_dir.join(QUEUE_FILE), &data).await?;
    debug!(
        jobs = queue.jobs.len(),
        postproc = queue.postproc.len(),
        "queue saved"
    );
    Ok(())
}

/// Read `queue.sab` from `admin_dir`; `None` when there is none
///
/// A file written by another format version is refused with
/// [`Error::QueueVersion`].
pub async fn load_queue(admin_dir: &Path) -> Result<Option<QueueFile>> {
    let path = admin_dir.join(QUEUE_FILE);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value: serde_json::Value = serde_json::from_slice(&data)?;
    let found = value
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32;
    if found != QUEUE_VERSION {
        return Err(Error::QueueVersion {
            found,
            expected: QUEUE_VERSION,
        });
    }
    Ok(Some(serde_json::from_value(value)?))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn queue_file_keeps_order() {
        let dir = TempDir::new().unwrap();
        let file = QueueFile::new(
            vec![
                JobRef {
                    id: JobId(2),
                    folder: "b".into(),
                },
                JobRef {
                    id: JobId(1),
                    folder: "a".into(),
                },
            ],
            vec![JobRef {
                id: JobId(3),
                folder: "c".into(),
            }],
            Vec::new(),
        );
        save_queue(dir.path(), &file).await.unwrap();

        let loaded = load_queue(dir.path()).await.unwrap().expect("file exists");
        assert_eq!(loaded, file);
        assert!(
            !dir.path().join("queue.sab.tmp").exists(),
            "temporary file renamed into place"
        );
    }

    #[tokio::test]
    async fn missing_queue_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(load_queue(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn other_versions_are_refused() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(QUEUE_FILE),
            br#"{"version": 7, "jobs": []}"#,
        )
        .unwrap();
        match load_queue(dir.path()).await {
            Err(Error::QueueVersion { found, expected }) => {
                assert_eq!((found, expected), (7, QUEUE_VERSION));
            }
            other => panic!("expected a version error, got {other:?}"),
        }
    }
}
