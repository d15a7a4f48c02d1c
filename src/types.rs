//! Core types for usenet-engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::PostProcess;

/// Unique identifier for a job (one NZB)
///
/// Rendered as 16 hex digits; the admin directory of a job and its snapshot
/// file are named after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Create a new random JobId
    pub fn generate() -> Self {
        Self(rand::random::<u64>())
    }

    /// Get the inner value
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Name of the job snapshot file inside the admin directory
    pub fn snapshot_name(&self) -> String {
        format!("nzo_{self}")
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("nzo_").unwrap_or(s);
        Ok(Self(u64::from_str_radix(hex, 16)?))
    }
}

/// Index of a server in the configured server list
///
/// Stable for the lifetime of the engine; a restarted server keeps its id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u16);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of a file within its job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u32);

impl FileId {
    /// Name of the article-table file inside the admin directory
    pub fn table_name(&self) -> String {
        format!("SABnzbd_nzf_{}", self.0)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one article, resolved against the queue under its lock
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArticleRef {
    /// Owning job
    pub job: JobId,
    /// Owning file
    pub file: FileId,
    /// Position in the file's decode table
    pub index: u32,
}

impl std::fmt::Display for ArticleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.job, self.file, self.index)
    }
}

/// Job priority
///
/// `Paused`, `Dup`, `Stop` and `Default` are only meaningful when a job is
/// added; [`Priority::resolve_on_add`] turns them into a real priority.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Re-queued for par2 top-up; always first
    Repair,
    /// Force start, ignores the queue pause
    Force,
    /// High priority
    High,
    /// Normal priority
    #[default]
    Normal,
    /// Low priority
    Low,
    /// Use the default priority
    Default,
    /// Add the job paused
    Paused,
    /// Add the job paused as a duplicate
    Dup,
    /// Do not queue the job
    Stop,
}

impl Priority {
    /// Convert integer priority code to Priority enum
    pub fn from_i32(priority: i32) -> Self {
        match priority {
            3 => Priority::Repair,
            2 => Priority::Force,
            1 => Priority::High,
            0 => Priority::Normal,
            -1 => Priority::Low,
            -2 => Priority::Paused,
            -3 => Priority::Dup,
            -4 => Priority::Stop,
            _ => Priority::Default,
        }
    }

    /// Convert Priority enum to integer priority code
    pub fn to_i32(&self) -> i32 {
        match self {
            Priority::Repair => 3,
            Priority::Force => 2,
            Priority::High => 1,
            Priority::Normal => 0,
            Priority::Low => -1,
            Priority::Paused => -2,
            Priority::Dup => -3,
            Priority::Stop => -4,
            Priority::Default => -100,
        }
    }

    /// Map an add-time priority to `(queue priority, start paused)`
    ///
    /// Returns `None` for [`Priority::Stop`], which means the job is not queued.
    pub fn resolve_on_add(self) -> Option<(Priority, bool)> {
        match self {
            Priority::Stop => None,
            Priority::Paused | Priority::Dup => Some((Priority::Normal, true)),
            Priority::Default => Some((Priority::Normal, false)),
            p => Some((p, false)),
        }
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_i32().cmp(&other.to_i32())
    }
}

/// Job status
///
/// Active states may move between each other (a par2 top-up sends a
/// verifying job back to the queue); the terminal states never change again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Waiting in the queue
    Queued,
    /// Availability pre-check running
    Checking,
    /// Articles being fetched
    Downloading,
    /// PAR2 verification
    Verifying,
    /// PAR2 repair
    Repairing,
    /// Archive extraction
    Extracting,
    /// Moving to the final directory
    Moving,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Paused by user
    Paused,
    /// Removed by user
    Deleted,
}

impl Status {
    /// Terminal states accept no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Deleted)
    }

    /// Whether a job may move from `self` to `next`
    pub fn can_transition_to(&self, next: Status) -> bool {
        !self.is_terminal() && *self != next
    }

    /// Whether the job sits with the post-processor
    pub fn is_post_processing(&self) -> bool {
        matches!(
            self,
            Status::Verifying | Status::Repairing | Status::Extracting | Status::Moving
        )
    }

    /// Convert Status enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            Status::Queued => 0,
            Status::Checking => 1,
            Status::Downloading => 2,
            Status::Verifying => 3,
            Status::Repairing => 4,
            Status::Extracting => 5,
            Status::Moving => 6,
            Status::Completed => 7,
            Status::Failed => 8,
            Status::Paused => 9,
            Status::Deleted => 10,
        }
    }

    /// Convert integer status code to Status enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => Status::Queued,
            1 => Status::Checking,
            2 => Status::Downloading,
            3 => Status::Verifying,
            4 => Status::Repairing,
            5 => Status::Extracting,
            6 => Status::Moving,
            7 => Status::Completed,
            9 => Status::Paused,
            10 => Status::Deleted,
            _ => Status::Failed,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::Checking => "checking",
            Status::Downloading => "downloading",
            Status::Verifying => "verifying",
            Status::Repairing => "repairing",
            Status::Extracting => "extracting",
            Status::Moving => "moving",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Paused => "paused",
            Status::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Post-processing stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Download stage
    Download,
    /// PAR2 verification and repair
    Repair,
    /// Split-file join
    Join,
    /// Archive extraction
    Extract,
    /// SFV checksum check
    Sfv,
    /// User script
    Script,
    /// Move to final destination
    Move,
    /// Cleanup of samples, markers and sources
    Cleanup,
    /// DirectUnpack (extraction during download)
    DirectUnpack,
}

/// Event emitted during the job lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job added to queue
    Queued {
        /// Job ID
        id: JobId,
        /// Job name
        name: String,
    },

    /// Job removed from queue by the user
    Removed {
        /// Job ID
        id: JobId,
    },

    /// Job status changed
    StatusChanged {
        /// Job ID
        id: JobId,
        /// New status
        status: Status,
    },

    /// Download progress update
    Downloading {
        /// Job ID
        id: JobId,
        /// Progress percentage (0.0 to 100.0)
        percent: f32,
        /// Current speed in bytes per second
        speed_bps: u64,
    },

    /// One file of a job is fully assembled
    FileCompleted {
        /// Job ID
        id: JobId,
        /// Final filename
        filename: String,
        /// Whether the combined CRC32 matched the segments
        crc_ok: bool,
    },

    /// A file was renamed using par2 metadata
    FileRenamed {
        /// Job ID
        id: JobId,
        /// Previous (obfuscated) filename
        old_name: String,
        /// Name from the par2 file description
        new_name: String,
    },

    /// Par2 volumes were moved from the held-back set into the download
    Par2Promoted {
        /// Job ID
        id: JobId,
        /// Par2 set name
        setname: String,
        /// Number of recovery blocks added
        blocks: u32,
    },

    /// All articles of a job are fetched (or hopeless); post-processing starts
    DownloadComplete {
        /// Job ID
        id: JobId,
        /// Articles that could not be fetched from any server
        bad_articles: u64,
    },

    /// PAR2 verification started
    Verifying {
        /// Job ID
        id: JobId,
    },

    /// PAR2 repair started
    Repairing {
        /// Job ID
        id: JobId,
        /// Blocks needed for repair
        blocks_needed: u32,
    },

    /// Archive extraction started
    Extracting {
        /// Job ID
        id: JobId,
        /// Archive filename
        archive: String,
    },

    /// Moving files to destination
    Moving {
        /// Job ID
        id: JobId,
        /// Destination path
        destination: PathBuf,
    },

    /// Job fully complete
    Complete {
        /// Job ID
        id: JobId,
        /// Final path
        path: PathBuf,
    },

    /// Job failed at some stage
    Failed {
        /// Job ID
        id: JobId,
        /// Stage where failure occurred
        stage: Stage,
        /// Error message
        error: String,
    },

    /// DirectUnpack started on a RAR set
    DirectUnpackStarted {
        /// Job ID
        id: JobId,
        /// Set name
        setname: String,
    },

    /// DirectUnpack finished a RAR set ("All OK")
    DirectUnpackComplete {
        /// Job ID
        id: JobId,
        /// Set name
        setname: String,
    },

    /// DirectUnpack aborted; normal extraction will run
    DirectUnpackAborted {
        /// Job ID
        id: JobId,
        /// Reason for the abort
        reason: String,
    },

    /// Server disabled after errors
    ServerDisabled {
        /// Server name
        server: String,
        /// Why it was disabled
        reason: String,
        /// Time until the scheduled reactivation
        penalty: Duration,
    },

    /// Server re-enabled
    ServerReactivated {
        /// Server name
        server: String,
    },

    /// Downloader paused
    QueuePaused,

    /// Downloader resumed
    QueueResumed,

    /// Non-fatal problem the user should know about (e.g. disk full)
    Warning {
        /// Message
        message: String,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Options for adding a job to the queue
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Category to assign
    #[serde(default)]
    pub category: Option<String>,

    /// Override the default post-processing mode
    #[serde(default)]
    pub post_process: Option<PostProcess>,

    /// Job priority
    #[serde(default)]
    pub priority: Priority,

    /// Archive password (overrides anything in the name or NZB meta)
    #[serde(default)]
    pub password: Option<String>,

    /// User script override
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Source URL, kept for retries
    #[serde(default)]
    pub url: Option<String>,
}

/// Historical job record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Database row id (0 when not stored in the database)
    pub id: i64,

    /// Job that produced this record
    pub job_id: JobId,

    /// Job name
    pub name: String,

    /// Category (if assigned)
    pub category: Option<String>,

    /// Final destination path (if completed successfully)
    pub destination: Option<PathBuf>,

    /// Final status (Completed or Failed)
    pub status: Status,

    /// Failure message, if any
    pub fail_message: Option<String>,

    /// Total size in bytes
    pub size_bytes: u64,

    /// Time spent downloading (not including queue wait time)
    pub download_time: Duration,

    /// When the job finished (successfully or not)
    pub completed_at: DateTime<Utc>,
}

/// Summary of one queued job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job ID
    pub id: JobId,
    /// Job name
    pub name: String,
    /// Status
    pub status: Status,
    /// Priority
    pub priority: Priority,
    /// Total bytes
    pub size_bytes: u64,
    /// Bytes downloaded so far
    pub downloaded_bytes: u64,
    /// Bytes unavailable on every server
    pub missing_bytes: u64,
}

/// Queue statistics
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs in the download queue
    pub jobs: Vec<JobSummary>,
    /// Jobs waiting for or in post-processing
    pub post_processing: usize,
    /// Whether the downloader is paused
    pub paused: bool,
    /// Current receive rate (bytes per second)
    pub speed_bps: u64,
    /// Current bandwidth limit (0 = unlimited)
    pub bandwidth_limit: u64,
    /// Bytes held by the article cache in memory
    pub cache_bytes: u64,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_display_and_parse_agree() {
        let id = JobId(0xdead_beef);
        assert_eq!(id.to_string(), "00000000deadbeef");
        assert_eq!("00000000deadbeef".parse::<JobId>().unwrap(), id);
        assert_eq!(
            id.snapshot_name().parse::<JobId>().unwrap(),
            id,
            "snapshot names parse back to the id"
        );
    }

    #[test]
    fn priority_orders_by_numeric_value() {
        assert!(Priority::Repair > Priority::Force);
        assert!(Priority::Force > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        for value in [3, 2, 1, 0, -1, -2, -3, -4, -100] {
            assert_eq!(Priority::from_i32(value).to_i32(), value);
        }
    }

    #[test]
    fn add_time_priorities_resolve() {
        assert_eq!(
            Priority::Paused.resolve_on_add(),
            Some((Priority::Normal, true))
        );
        assert_eq!(Priority::Dup.resolve_on_add(), Some((Priority::Normal, true)));
        assert_eq!(
            Priority::Default.resolve_on_add(),
            Some((Priority::Normal, false))
        );
        assert_eq!(Priority::High.resolve_on_add(), Some((Priority::High, false)));
        assert_eq!(Priority::Stop.resolve_on_add(), None);
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [Status::Completed, Status::Failed, Status::Deleted] {
            for next in [Status::Queued, Status::Downloading, Status::Failed] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not move to {next}"
                );
            }
        }
        assert!(Status::Verifying.can_transition_to(Status::Queued));
        assert!(Status::Downloading.can_transition_to(Status::Verifying));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::Par2Promoted {
            id: JobId(1),
            setname: "foo".into(),
            blocks: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "par2_promoted");
        assert_eq!(json["blocks"], 5);
    }
}
