//! Error types for usenet-engine
//!
//! This module provides the error handling for the library:
//! - Domain-specific error types (NNTP, yEnc decode, download, post-processing)
//! - Machine-readable error codes used in history records and events
//! - Context information (job id, server, archive path, etc.)
//!
//! Server-side failures that the downloader recovers from on its own (penalties,
//! missing articles, capability probing) are classified by
//! [`crate::server::ErrorClass`] and never surface as an [`Error`].

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for usenet-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "servers")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    /// yEnc decoding failed
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Download-related error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Post-processing error (verify, repair, extract, etc.)
    #[error("post-processing error: {0}")]
    PostProcess(#[from] PostProcessError),

    /// Invalid NZB file
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Job or server not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The queue file on disk was written by an incompatible version
    #[error("queue file version {found} is not supported (expected {expected})")]
    QueueVersion {
        /// Version found in the queue file
        found: u32,
        /// Version this build reads and writes
        expected: u32,
    },

    /// The disk holding the incomplete directory ran out of space
    #[error("disk full while writing {path}")]
    DiskFull {
        /// File that was being written
        path: PathBuf,
    },

    /// External tool execution failed (par2, unrar, scripts)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, not implemented, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Errors raised by an NNTP connection
///
/// These are reported by the socket tasks to the downloader loop, which turns
/// them into connection resets and server penalties.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NntpError {
    /// No complete response arrived before the connection deadline
    #[error("timed out")]
    Timeout,

    /// The server closed the socket
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Address resolution or TCP connect failed
    #[error("cannot connect to {host}:{port}: {reason}")]
    Connect {
        /// Server host
        host: String,
        /// Server port
        port: u16,
        /// Underlying reason
        reason: String,
    },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The response did not fit into the receive buffer
    #[error("response exceeds the {max} byte receive buffer")]
    BufferOverflow {
        /// Hard buffer ceiling in bytes
        max: usize,
    },

    /// Login was refused
    #[error("authentication failed ({code}): {message}")]
    Auth {
        /// NNTP status code
        code: u16,
        /// Server message
        message: String,
    },

    /// The server replied with an unexpected status code
    #[error("unexpected response ({code}): {message}")]
    Response {
        /// NNTP status code
        code: u16,
        /// Server message
        message: String,
    },

    /// Socket-level I/O error
    #[error("socket error: {0}")]
    Io(String),
}

impl From<std::io::Error> for NntpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset => {
                NntpError::ConnectionClosed
            }
            std::io::ErrorKind::TimedOut => NntpError::Timeout,
            _ => NntpError::Io(e.to_string()),
        }
    }
}

/// yEnc decoding errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// No `=ybegin` line in the article body
    #[error("missing =ybegin header")]
    MissingHeader,

    /// No `=yend` line in the article body
    #[error("missing =yend trailer")]
    MissingTrailer,

    /// A header or trailer field could not be parsed
    #[error("malformed yEnc field {field}")]
    MalformedField {
        /// Name of the field (e.g. "size", "begin")
        field: &'static str,
    },

    /// Decoded size differs from the trailer's `size=`
    #[error("size mismatch: trailer says {expected}, decoded {actual}")]
    SizeMismatch {
        /// Size announced by the trailer
        expected: u64,
        /// Number of bytes actually decoded
        actual: u64,
    },

    /// CRC32 of the decoded part differs from the trailer's `pcrc32=`
    #[error("CRC32 mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch {
        /// CRC announced by the trailer
        expected: u32,
        /// CRC of the decoded bytes
        actual: u32,
    },
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Job not found in queue
    #[error("job {id} not found")]
    NotFound {
        /// The job ID that was not found
        id: String,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} job {id} in state {current_state}")]
    InvalidState {
        /// The job ID that is in an invalid state for the operation
        id: String,
        /// The operation that was attempted (e.g., "resume", "move")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// Too much of the job is unavailable on every server
    #[error("job {id} is hopeless: {reason}")]
    Hopeless {
        /// The job ID
        id: String,
        /// Why the job cannot complete
        reason: String,
    },

    /// Insufficient disk space to continue
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },
}

/// Post-processing errors (PAR2 verify, repair, extraction, etc.)
#[derive(Debug, Error)]
pub enum PostProcessError {
    /// PAR2 verification failed
    #[error("PAR2 verification failed for job {id}: {reason}")]
    VerificationFailed {
        /// The job ID for which verification failed
        id: String,
        /// The reason verification failed
        reason: String,
    },

    /// PAR2 repair failed
    #[error("PAR2 repair failed for job {id}: {reason}")]
    RepairFailed {
        /// The job ID for which repair failed
        id: String,
        /// The reason repair failed
        reason: String,
    },

    /// Archive extraction failed
    #[error("extraction failed for {archive}: {reason}")]
    ExtractionFailed {
        /// The archive file that failed to extract
        archive: PathBuf,
        /// The reason extraction failed
        reason: String,
    },

    /// Wrong password for encrypted archive
    #[error("wrong password for encrypted archive {archive}")]
    WrongPassword {
        /// The encrypted archive that could not be opened
        archive: PathBuf,
    },

    /// Split-file join failed
    #[error("join failed for {target}: {reason}")]
    JoinFailed {
        /// The file being assembled
        target: PathBuf,
        /// The reason the join failed
        reason: String,
    },

    /// SFV checksum mismatch
    #[error("SFV check failed for {file}")]
    SfvMismatch {
        /// File whose checksum did not match
        file: PathBuf,
    },

    /// User script exited with a failure status
    #[error("script {script} failed with exit code {code:?}")]
    ScriptFailed {
        /// Script path
        script: PathBuf,
        /// Exit code (None when killed by a signal)
        code: Option<i32>,
    },

    /// File move/rename failed
    #[error("failed to move {source_path} to {dest_path}: {reason}")]
    MoveFailed {
        /// The source path of the file being moved
        source_path: PathBuf,
        /// The destination path where the file should be moved
        dest_path: PathBuf,
        /// The reason the move failed
        reason: String,
    },

    /// File collision at destination
    #[error("file collision at {path}: {reason}")]
    FileCollision {
        /// The path where the collision occurred
        path: PathBuf,
        /// The reason for the collision (e.g., "file already exists")
        reason: String,
    },

    /// Invalid path encountered during post-processing
    #[error("invalid path {path}: {reason}")]
    InvalidPath {
        /// The invalid path that was encountered
        path: PathBuf,
        /// The reason the path is invalid
        reason: String,
    },

    /// Post-processing was cancelled (job deleted or shutdown)
    #[error("post-processing cancelled for job {id}")]
    Cancelled {
        /// The job ID
        id: String,
    },
}

impl Error {
    /// Machine-readable error code, stored with failed history records
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Nntp(_) => "nntp_error",
            Error::Decode(_) => "decode_error",
            Error::Download(e) => match e {
                DownloadError::NotFound { .. } => "job_not_found",
                DownloadError::InvalidState { .. } => "invalid_state",
                DownloadError::Hopeless { .. } => "hopeless",
                DownloadError::InsufficientSpace { .. } => "insufficient_space",
            },
            Error::PostProcess(e) => match e {
                PostProcessError::VerificationFailed { .. } => "verification_failed",
                PostProcessError::RepairFailed { .. } => "repair_failed",
                PostProcessError::ExtractionFailed { .. } => "extraction_failed",
                PostProcessError::WrongPassword { .. } => "wrong_password",
                PostProcessError::JoinFailed { .. } => "join_failed",
                PostProcessError::SfvMismatch { .. } => "sfv_mismatch",
                PostProcessError::ScriptFailed { .. } => "script_failed",
                PostProcessError::MoveFailed { .. } => "move_failed",
                PostProcessError::FileCollision { .. } => "file_collision",
                PostProcessError::InvalidPath { .. } => "invalid_path",
                PostProcessError::Cancelled { .. } => "cancelled",
            },
            Error::InvalidNzb(_) => "invalid_nzb",
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::Serialization(_) => "serialization_error",
            Error::QueueVersion { .. } => "queue_version",
            Error::DiskFull { .. } => "disk_full",
            Error::ExternalTool(_) => "external_tool_error",
            Error::NotSupported(_) => "not_supported",
            Error::Other(_) => "internal_error",
        }
    }

    /// Whether the error is an out-of-space condition on the download disk
    pub fn is_disk_full(&self) -> bool {
        match self {
            Error::DiskFull { .. } => true,
            Error::Download(DownloadError::InsufficientSpace { .. }) => true,
            Error::Io(e) => is_disk_full_io(e),
            _ => false,
        }
    }
}

/// Recognize ENOSPC / ERROR_DISK_FULL from a raw I/O error
pub(crate) fn is_disk_full_io(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    #[cfg(unix)]
    {
        e.raw_os_error() == Some(libc::ENOSPC)
    }
    #[cfg(not(unix))]
    {
        // ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL
        matches!(e.raw_os_error(), Some(112) | Some(39))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_error_variant_has_a_stable_code() {
        let cases: Vec<(Error, &str)> = vec![
            (
                Error::Config {
                    message: "no servers".into(),
                    key: Some("servers".into()),
                },
                "config_error",
            ),
            (
                Error::Database(DatabaseError::QueryFailed("locked".into())),
                "database_error",
            ),
            (Error::Nntp(NntpError::Timeout), "nntp_error"),
            (Error::Decode(DecodeError::MissingHeader), "decode_error"),
            (
                Error::Download(DownloadError::Hopeless {
                    id: "abc".into(),
                    reason: "50% missing".into(),
                }),
                "hopeless",
            ),
            (
                Error::PostProcess(PostProcessError::SfvMismatch {
                    file: PathBuf::from("a.rar"),
                }),
                "sfv_mismatch",
            ),
            (Error::InvalidNzb("no files".into()), "invalid_nzb"),
            (Error::ShuttingDown, "shutting_down"),
            (
                Error::QueueVersion {
                    found: 1,
                    expected: 2,
                },
                "queue_version",
            ),
            (
                Error::DiskFull {
                    path: PathBuf::from("/tmp/x"),
                },
                "disk_full",
            ),
            (Error::Other("boom".into()), "internal_error"),
        ];

        for (error, code) in cases {
            assert_eq!(error.error_code(), code, "wrong code for {error}");
        }
    }

    #[test]
    fn queue_version_message_names_both_versions() {
        let err = Error::QueueVersion {
            found: 7,
            expected: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains('7') && msg.contains("10"), "got: {msg}");
    }

    #[test]
    fn io_errors_map_to_nntp_errors() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(NntpError::from(eof), NntpError::ConnectionClosed);

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(NntpError::from(timeout), NntpError::Timeout);

        let other = std::io::Error::other("weird");
        assert!(matches!(NntpError::from(other), NntpError::Io(_)));
    }

    #[test]
    fn disk_full_is_recognized() {
        let err = Error::DiskFull {
            path: PathBuf::from("/incomplete/job/file"),
        };
        assert!(err.is_disk_full());

        let storage_full = std::io::Error::new(std::io::ErrorKind::StorageFull, "full");
        assert!(Error::Io(storage_full).is_disk_full());

        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(!Error::Io(not_found).is_disk_full());
    }
}
