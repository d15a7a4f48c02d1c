//! Joining split files and checking SFV lists

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::error::{Error, PostProcessError, Result};

/// `name.ext.001`
#[allow(clippy::expect_used)]
static SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+)\.(\d{3})$").expect("valid split regex"));

/// `name.001.ts`
#[allow(clippy::expect_used)]
static TS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.+)\.(\d{3})\.ts$").expect("valid ts regex"));

/// Output name and part number of a split file
fn split_part(name: &str) -> Option<(String, u32)> {
    let caps = SPLIT_RE.captures(name)?;
    Some((caps[1].to_string(), caps[2].parse().ok()?))
}

/// Output name and part number of a split transport stream
fn ts_part(name: &str) -> Option<(String, u32)> {
    let caps = TS_RE.captures(name)?;
    Some((format!("{}.ts", &caps[1]), caps[2].parse().ok()?))
}

/// Join `name.ext.001`, `.002`... into `name.ext`; returns the joined parts
pub(crate) async fn join_split_files(dir: &Path) -> Result<Vec<PathBuf>> {
    join_by(dir, split_part).await
}

/// Join `name.001.ts`, `name.002.ts`... into `name.ts`; returns the joined parts
pub(crate) async fn join_ts_files(dir: &Path) -> Result<Vec<PathBuf>> {
    join_by(dir, ts_part).await
}

async fn join_by(dir: &Path, part: fn(&str) -> Option<(String, u32)>) -> Result<Vec<PathBuf>> {
    let mut sets: BTreeMap<String, BTreeMap<u32, PathBuf>> = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && let Some((target, number)) = part(name)
        {
            sets.entry(target).or_default().insert(number, entry.path());
        }
    }

    let mut joined = Vec::new();
    for (target, parts) in sets {
        // a lone .001 is a file of its own, and a set has to start at 1
        if parts.len() < 2 || parts.keys().next() != Some(&1) {
            continue;
        }
        if parts.keys().zip(1..).any(|(n, expected)| *n != expected) {
            warn!(target = %target, parts = parts.len(), "split set has gaps, not joining");
            continue;
        }
        let output = dir.join(&target);
        if tokio::fs::try_exists(&output).await.unwrap_or(false) {
            debug!(target = %target, "joined file already exists");
            continue;
        }
        let paths: Vec<PathBuf> = parts.into_values().collect();
        let inputs = paths.clone();
        let out = output.clone();
        spawn_blocking(move || concat(&inputs, &out))
            .await
            .map_err(|e| PostProcessError::JoinFailed {
                target: output.clone(),
                reason: format!("join task panicked: {e}"),
            })?
            .map_err(|e| PostProcessError::JoinFailed {
                target: output.clone(),
                reason: e.to_string(),
            })?;
        info!(target = %target, parts = paths.len(), "joined split file");
        joined.extend(paths);
    }
    Ok(joined)
}

fn concat(parts: &[PathBuf], output: &Path) -> std::io::Result<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(output)?);
    for part in parts {
        let mut input = std::fs::File::open(part)?;
        std::io::copy(&mut input, &mut out)?;
    }
    out.flush()
}

/// Verify every file listed in the `.sfv` files of `dir`; returns how many
/// files were checked
///
/// Files that are not present are skipped.
pub(crate) async fn check_sfv(dir: &Path) -> Result<usize> {
    let mut listed: Vec<(PathBuf, u32)> = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_sfv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("sfv"));
        if !is_sfv {
            continue;
        }
        let content = tokio::fs::read(&path).await?;
        listed.extend(
            parse_sfv(&String::from_utf8_lossy(&content))
                .into_iter()
                .map(|(name, crc)| (dir.join(name), crc)),
        );
    }

    let mut checked = 0;
    for (path, expected) in listed {
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            continue;
        }
        let target = path.clone();
        let actual = spawn_blocking(move || file_crc(&target))
            .await
            .map_err(|e| Error::Other(format!("crc task panicked: {e}")))??;
        if actual != expected {
            warn!(file = %path.display(), expected = %format!("{expected:08x}"), actual = %format!("{actual:08x}"), "sfv mismatch");
            return Err(PostProcessError::SfvMismatch { file: path }.into());
        }
        checked += 1;
    }
    if checked > 0 {
        info!(files = checked, "sfv check passed");
    }
    Ok(checked)
}

/// `(filename, crc)` pairs of an SFV file; comments start with `;`
fn parse_sfv(content: &str) -> Vec<(String, u32)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(';'))
        .filter_map(|line| {
            let (name, crc) = line.rsplit_once(char::is_whitespace)?;
            let crc = u32::from_str_radix(crc.trim(), 16).ok()?;
            Some((name.trim().to_string(), crc))
        })
        .collect()
}

fn file_crc(path: &Path) -> std::io::Result<u32> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
