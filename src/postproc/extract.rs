//! Archive extraction: RAR through an external unrar, 7z and zip in-process

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directunpack::{EXTRACT_DIR, is_first_rar_volume, rar_volume};
use crate::error::{Error, PostProcessError, Result};
use crate::process;

/// Passwords to try on an encrypted archive, in order
#[derive(Debug, Clone)]
pub(crate) struct PasswordList {
    passwords: Vec<String>,
}

impl PasswordList {
    /// The job password, then every line of `password_file`, then the empty
    /// password; duplicates dropped
    pub(crate) async fn collect(job_password: Option<&str>, password_file: Option<&Path>) -> Self {
        let mut passwords: Vec<String> = job_password
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .into_iter()
            .collect();

        if let Some(path) = password_file {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    for line in content.lines().map(str::trim) {
                        if !line.is_empty() && !passwords.iter().any(|p| p == line) {
                            passwords.push(line.to_string());
                        }
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot read password file"),
            }
        }
        passwords.push(String::new());
        debug!(count = passwords.len(), "collected archive passwords");
        Self { passwords }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &str> {
        self.passwords.iter().map(String::as_str)
    }
}

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveKind {
    Rar,
    SevenZip,
    Zip,
}

/// An archive found on disk
#[derive(Debug, Clone)]
pub(crate) struct Archive {
    /// First volume
    pub path: PathBuf,
    pub kind: ArchiveKind,
    /// RAR set name; empty for 7z and zip
    pub setname: String,
}

impl Archive {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn classify(path: &Path) -> Option<Archive> {
    let name = path.file_name()?.to_str()?;
    if is_first_rar_volume(name) {
        let (setname, _) = rar_volume(name)?;
        return Some(Archive {
            path: path.to_path_buf(),
            kind: ArchiveKind::Rar,
            setname,
        });
    }
    let kind = match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
        "7z" => ArchiveKind::SevenZip,
        "zip" => ArchiveKind::Zip,
        _ => return None,
    };
    Some(Archive {
        path: path.to_path_buf(),
        kind,
        setname: String::new(),
    })
}

/// Archives directly inside `dir`, RAR sets in `skip_sets` left out
pub(crate) async fn find_archives(dir: &Path, skip_sets: &BTreeSet<String>) -> Result<Vec<Archive>> {
    let mut archives = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(archive) = classify(&entry.path())
            && !(archive.kind == ArchiveKind::Rar && skip_sets.contains(&archive.setname))
        {
            archives.push(archive);
        }
    }
    archives.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(archives)
}

/// Every volume of a RAR set in `dir`
pub(crate) async fn rar_set_volumes(dir: &Path, setname: &str) -> Result<Vec<PathBuf>> {
    let mut volumes = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str()
            && rar_volume(name).is_some_and(|(set, _)| set == setname)
        {
            volumes.push(entry.path());
        }
    }
    Ok(volumes)
}

/// Extraction settings shared by every archive of a job
pub(crate) struct Extractor<'a> {
    pub unrar: Option<&'a Path>,
    pub passwords: &'a PasswordList,
    pub cancel: &'a CancellationToken,
}

impl Extractor<'_> {
    /// Extract `archive` into `dest`, trying every password
    pub(crate) async fn extract(&self, archive: &Archive, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        for (attempt, password) in self.passwords.iter().enumerate() {
            let result = match archive.kind {
                ArchiveKind::Rar => self.extract_rar(&archive.path, password, dest).await,
                ArchiveKind::SevenZip => {
                    blocking(&archive.path, password, dest, extract_7z).await
                }
                ArchiveKind::Zip => blocking(&archive.path, password, dest, extract_zip).await,
            };
            match result {
                Ok(()) => {
                    info!(archive = %archive.name(), attempt = attempt + 1, "archive extracted");
                    return Ok(());
                }
                Err(Error::PostProcess(PostProcessError::WrongPassword { .. })) => {
                    debug!(archive = %archive.name(), attempt = attempt + 1, "wrong password, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Err(PostProcessError::WrongPassword {
            archive: archive.path.clone(),
        }
        .into())
    }

    async fn extract_rar(&self, archive: &Path, password: &str, dest: &Path) -> Result<()> {
        let unrar = self.unrar.ok_or_else(|| {
            Error::NotSupported(format!("no unrar binary to extract {}", archive.display()))
        })?;
        let password = if password.is_empty() {
            "-p-".to_string()
        } else {
            format!("-p{password}")
        };
        let mut dest_arg = dest.as_os_str().to_owned();
        dest_arg.push(std::path::MAIN_SEPARATOR_STR);
        let args = [
            "x".into(),
            "-o+".into(),
            "-y".into(),
            password.into(),
            archive.as_os_str().to_owned(),
            dest_arg,
        ];
        let output = process::run(unrar, &args, archive.parent(), self.cancel).await?;

        let wrong_password = output.lines.iter().any(|line| {
            let line = line.to_ascii_lowercase();
            line.contains("password is incorrect")
                || line.contains("incorrect password")
                || line.contains("wrong password")
        });
        if wrong_password {
            return Err(PostProcessError::WrongPassword {
                archive: archive.to_path_buf(),
            }
            .into());
        }
        if output.status.success() && output.lines.iter().any(|l| l.contains("All OK")) {
            return Ok(());
        }
        let reason = output
            .lines
            .iter()
            .rev()
            .find(|l| !l.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| format!("unrar exited with {}", output.status));
        Err(PostProcessError::ExtractionFailed {
            archive: archive.to_path_buf(),
            reason,
        }
        .into())
    }
}

async fn blocking(
    archive: &Path,
    password: &str,
    dest: &Path,
    extract: fn(&Path, &str, &Path) -> Result<()>,
) -> Result<()> {
    let (archive_owned, password, dest) = (archive.to_path_buf(), password.to_string(), dest.to_path_buf());
    spawn_blocking(move || extract(&archive_owned, &password, &dest))
        .await
        .map_err(|e| {
            Error::PostProcess(PostProcessError::ExtractionFailed {
                archive: archive.to_path_buf(),
                reason: format!("extraction task panicked: {e}"),
            })
        })?
}

fn password_error(archive: &Path, message: String) -> Error {
    let lower = message.to_ascii_lowercase();
    if lower.contains("password") || lower.contains("encrypted") {
        PostProcessError::WrongPassword {
            archive: archive.to_path_buf(),
        }
        .into()
    } else {
        PostProcessError::ExtractionFailed {
            archive: archive.to_path_buf(),
            reason: message,
        }
        .into()
    }
}

fn extract_7z(archive: &Path, password: &str, dest: &Path) -> Result<()> {
    let result = if password.is_empty() {
        sevenz_rust::decompress_file(archive, dest)
    } else {
        sevenz_rust::decompress_file_with_password(archive, dest, sevenz_rust::Password::from(password))
    };
    result.map_err(|e| password_error(archive, e.to_string()))
}

fn extract_zip(archive: &Path, password: &str, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| password_error(archive, e.to_string()))?;

    for index in 0..zip.len() {
        let mut entry = if password.is_empty() {
            zip.by_index(index)
                .map_err(|e| password_error(archive, e.to_string()))?
        } else {
            zip.by_index_decrypt(index, password.as_bytes())
                .map_err(|e| password_error(archive, e.to_string()))?
                .map_err(|_| PostProcessError::WrongPassword {
                    archive: archive.to_path_buf(),
                })?
        };
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(archive = %archive.display(), entry = entry.name(), "skipping entry with unsafe path");
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out).map_err(|e| password_error(archive, e.to_string()))?;
    }
    Ok(())
}

/// What the extraction of a job produced
#[derive(Debug, Default)]
pub(crate) struct Unpacked {
    /// Archive files that were extracted successfully
    pub sources: Vec<PathBuf>,
    /// Archives extracted, nested ones included
    pub count: usize,
}

/// Extract the archives of `download_path` into its `extracted` directory,
/// then archives found in there, up to `max_depth` levels
///
/// Nested archives are extracted next to themselves and removed afterwards.
pub(crate) async fn unpack(
    extractor: &Extractor<'_>,
    download_path: &Path,
    skip_sets: &BTreeSet<String>,
    max_depth: u32,
    mut on_archive: impl FnMut(&str),
) -> Result<Unpacked> {
    let dest = download_path.join(EXTRACT_DIR);
    let mut unpacked = Unpacked::default();

    for archive in find_archives(download_path, skip_sets).await? {
        on_archive(&archive.name());
        extractor.extract(&archive, &dest).await?;
        unpacked.count += 1;
        if archive.kind == ArchiveKind::Rar {
            unpacked
                .sources
                .extend(rar_set_volumes(download_path, &archive.setname).await?);
        } else {
            unpacked.sources.push(archive.path);
        }
    }

    let mut tried: HashSet<PathBuf> = HashSet::new();
    for depth in 1..=max_depth {
        if !tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            break;
        }
        let nested: Vec<Archive> = nested_archives(&dest)
            .await?
            .into_iter()
            .filter(|a| tried.insert(a.path.clone()))
            .collect();
        if nested.is_empty() {
            break;
        }
        for archive in nested {
            let Some(parent) = archive.path.parent().map(Path::to_path_buf) else {
                continue;
            };
            on_archive(&archive.name());
            debug!(archive = %archive.name(), depth, "extracting nested archive");
            if let Err(e) = extractor.extract(&archive, &parent).await {
                warn!(archive = %archive.path.display(), error = %e, "nested archive failed, keeping it");
                continue;
            }
            unpacked.count += 1;
            let volumes = if archive.kind == ArchiveKind::Rar {
                rar_set_volumes(&parent, &archive.setname).await?
            } else {
                vec![archive.path.clone()]
            };
            for volume in volumes {
                if let Err(e) = tokio::fs::remove_file(&volume).await {
                    debug!(path = %volume.display(), error = %e, "failed to remove nested archive");
                }
            }
        }
    }
    Ok(unpacked)
}

/// Archives anywhere below `dir`
async fn nested_archives(dir: &Path) -> Result<Vec<Archive>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file()
                && let Some(archive) = classify(&entry.path())
            {
                found.push(archive);
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}
