//! Verification and repair through a [`ParityHandler`]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::output::{ExitStatus, parse_repair_output, parse_verify_output};
use crate::error::{Error, Result};
use crate::process;

/// Result of a par2 verification
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct VerifyResult {
    /// Every file is intact
    pub is_complete: bool,
    /// Damaged or missing data blocks
    pub damaged_blocks: u32,
    /// Recovery blocks present on disk
    pub recovery_blocks_available: u32,
    /// Additional recovery blocks required before a repair can succeed
    pub blocks_needed: u32,
    /// Repair can succeed with the blocks present
    pub repairable: bool,
    /// Damaged files
    pub damaged_files: Vec<String>,
    /// Missing files
    pub missing_files: Vec<String>,
}

/// Result of a par2 repair
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct RepairResult {
    /// Repair finished successfully
    pub success: bool,
    /// Repaired files
    pub repaired_files: Vec<String>,
    /// Files that could not be repaired
    pub failed_files: Vec<String>,
    /// Error text reported by the tool
    pub error: Option<String>,
}

/// PAR2 verification and repair
///
/// Both operations stop and kill any external process when `cancel` fires.
#[async_trait]
pub trait ParityHandler: Send + Sync {
    /// Verify the set described by `par2_file`
    async fn verify(&self, par2_file: &Path, cancel: &CancellationToken) -> Result<VerifyResult>;

    /// Repair the set described by `par2_file`
    async fn repair(&self, par2_file: &Path, cancel: &CancellationToken) -> Result<RepairResult>;

    /// Whether this handler can repair at all
    fn can_repair(&self) -> bool;

    /// Name for logging
    fn name(&self) -> &'static str;
}

/// Handler running an external `par2` binary
pub struct CliParityHandler {
    binary_path: PathBuf,
}

impl CliParityHandler {
    /// Use the binary at `binary_path`
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Look for `par2` on the search path
    pub fn from_path() -> Option<Self> {
        which::which("par2").ok().map(Self::new)
    }

    async fn run(
        &self,
        command: &str,
        par2_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<(Vec<String>, ExitStatus)> {
        let cwd = par2_file.parent();
        let output = process::run(
            &self.binary_path,
            [std::ffi::OsStr::new(command), par2_file.as_os_str()],
            cwd,
            cancel,
        )
        .await?;
        debug!(
            par2 = %par2_file.display(),
            command,
            code = ?output.status.code(),
            lines = output.lines.len(),
            "par2 finished"
        );
        Ok((output.lines, ExitStatus::from(output.status.success())))
    }
}

#[async_trait]
impl ParityHandler for CliParityHandler {
    async fn verify(&self, par2_file: &Path, cancel: &CancellationToken) -> Result<VerifyResult> {
        let (lines, status) = self.run("v", par2_file, cancel).await?;
        Ok(parse_verify_output(&lines, status))
    }

    async fn repair(&self, par2_file: &Path, cancel: &CancellationToken) -> Result<RepairResult> {
        let (lines, status) = self.run("r", par2_file, cancel).await?;
        Ok(parse_repair_output(&lines, status))
    }

    fn can_repair(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "cli-par2"
    }
}

/// Handler used when no par2 binary is available
///
/// Verification reports an intact set so downloads still complete; repair
/// is refused.
pub struct NoOpParityHandler;

#[async_trait]
impl ParityHandler for NoOpParityHandler {
    async fn verify(&self, _par2_file: &Path, _cancel: &CancellationToken) -> Result<VerifyResult> {
        Ok(VerifyResult {
            is_complete: true,
            ..Default::default()
        })
    }

    async fn repair(&self, _par2_file: &Path, _cancel: &CancellationToken) -> Result<RepairResult> {
        Err(Error::NotSupported(
            "par2 repair requires the par2 binary".into(),
        ))
    }

    fn can_repair(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
