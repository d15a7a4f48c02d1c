//! Parser for par2cmdline verify and repair output

use super::handler::{RepairResult, VerifyResult};

/// Exit status of an external command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Exit code 0
    Success,
    /// Any other exit
    Failure,
}

impl ExitStatus {
    /// Returns `true` for [`ExitStatus::Success`]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl From<bool> for ExitStatus {
    fn from(success: bool) -> Self {
        if success { Self::Success } else { Self::Failure }
    }
}

/// Parse the output of `par2 v`
///
/// Recognised lines include:
/// - `Target: "name" - missing.` / `- damaged. Found 3 of 5 data blocks.`
/// - `You have 12 recovery blocks available.`
/// - `You need 4 more recovery blocks to be able to repair.`
/// - `All files are correct, repair is not required.`
pub fn parse_verify_output<S: AsRef<str>>(lines: &[S], exit_status: ExitStatus) -> VerifyResult {
    let mut damaged_blocks = 0;
    let mut recovery_blocks_available = 0;
    let mut blocks_needed = 0;
    let mut all_correct = false;
    let mut damaged_files = Vec::new();
    let mut missing_files = Vec::new();

    for line in lines {
        let line = line.as_ref();
        let lower = line.to_lowercase();

        if lower.contains("all files are correct") {
            all_correct = true;
        }

        if lower.contains("you need")
            && lower.contains("more recovery block")
            && let Some(count) = number_before_blocks(&lower)
        {
            blocks_needed = blocks_needed.max(count);
        } else if lower.contains("recovery")
            && lower.contains("block")
            && lower.contains("available")
            && let Some(count) = number_before_blocks(&lower)
        {
            recovery_blocks_available = recovery_blocks_available.max(count);
        } else if lower.contains("repair is required")
            || (lower.contains("damaged") && lower.contains("block"))
        {
            if let Some(count) = missing_block_count(&lower) {
                damaged_blocks = damaged_blocks.max(count);
            }
        }

        if lower.contains("- missing")
            && let Some(filename) = quoted_filename(line)
            && !missing_files.contains(&filename)
        {
            missing_files.push(filename);
        }
        if lower.contains("- damaged")
            && let Some(filename) = quoted_filename(line)
            && !damaged_files.contains(&filename)
        {
            damaged_files.push(filename);
        }
    }

    let is_complete = all_correct
        || (exit_status.is_success()
            && damaged_blocks == 0
            && blocks_needed == 0
            && missing_files.is_empty()
            && damaged_files.is_empty());
    let damaged = !is_complete;
    let repairable = damaged && blocks_needed == 0 && recovery_blocks_available > 0;

    VerifyResult {
        is_complete,
        damaged_blocks,
        recovery_blocks_available,
        blocks_needed,
        repairable,
        damaged_files,
        missing_files,
    }
}

/// Parse the output of `par2 r`
pub fn parse_repair_output<S: AsRef<str>>(lines: &[S], exit_status: ExitStatus) -> RepairResult {
    let mut repaired_files = Vec::new();
    let mut failed_files = Vec::new();
    let mut error = None;
    let mut complete = false;

    for line in lines {
        let line = line.as_ref();
        let lower = line.to_lowercase();

        if lower.contains("repair complete") {
            complete = true;
        }
        if (lower.contains("repaired") || lower.contains("restored"))
            && let Some(filename) = quoted_filename(line)
            && !repaired_files.contains(&filename)
        {
            repaired_files.push(filename);
        }
        if (lower.contains("failed") || lower.contains("could not repair"))
            && let Some(filename) = quoted_filename(line)
            && !failed_files.contains(&filename)
        {
            failed_files.push(filename);
        }
        if error.is_none()
            && (lower.contains("error") || lower.contains("repair is not possible"))
        {
            error = Some(line.trim().to_string());
        }
    }

    let success = exit_status.is_success() && (complete || failed_files.is_empty());
    if !success && error.is_none() {
        error = lines
            .iter()
            .rev()
            .map(|l| l.as_ref().trim())
            .find(|l| !l.is_empty())
            .map(str::to_string);
    }

    RepairResult {
        success,
        repaired_files,
        failed_files,
        error,
    }
}

/// Nearest number before a word starting with "block"
///
/// Handles "5 blocks", "Found 1999 of 2000 data blocks" and
/// "You have 577 recovery blocks".
fn number_before_blocks(line: &str) -> Option<u32> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let at = words.iter().position(|w| w.starts_with("block"))?;
    words[..at]
        .iter()
        .rev()
        .find_map(|w| w.trim_matches(|c: char| !c.is_ascii_digit()).parse().ok())
}

/// Blocks missing from "found X of Y data blocks" (Y - X)
fn missing_block_count(line: &str) -> Option<u32> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let found = words.iter().position(|w| *w == "found")?;
    let have: u32 = words.get(found + 1)?.parse().ok()?;
    if words.get(found + 2) != Some(&"of") {
        return None;
    }
    let total: u32 = words.get(found + 3)?.parse().ok()?;
    Some(total.saturating_sub(have))
}

/// First double-quoted string in a line
fn quoted_filename(line: &str) -> Option<String> {
    let start = line.find('"')?;
    let end = line[start + 1..].find('"')?;
    Some(line[start + 1..start + 1 + end].to_string())
}
