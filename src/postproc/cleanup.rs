//! Removal of samples, marker files and unpacked sources

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::CleanupConfig;
use crate::persistence::ADMIN_DIR;
use crate::utils::is_sample;

/// Files and folders selected for removal
#[derive(Debug, Default)]
struct Targets {
    files: Vec<PathBuf>,
    folders: Vec<PathBuf>,
}

/// Delete sample files and folders below `dir`
pub(crate) async fn remove_samples(dir: &Path) {
    let mut targets = Targets::default();
    collect(dir, &mut targets, &|path, is_dir| {
        is_sample(path) && (is_dir || path.extension().is_some())
    })
    .await;
    let (files, folders) = delete(&targets).await;
    if files + folders > 0 {
        info!(dir = %dir.display(), files, folders, "samples removed");
    }
}

/// Delete marker files (`.nfo`, `.sfv`, `.srr`...) below `dir`
pub(crate) async fn remove_markers(dir: &Path, config: &CleanupConfig) {
    let mut targets = Targets::default();
    collect(dir, &mut targets, &|path, is_dir| {
        !is_dir
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| {
                    config
                        .target_extensions
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(ext))
                })
    })
    .await;
    let (files, _) = delete(&targets).await;
    if files > 0 {
        info!(dir = %dir.display(), files, "marker files removed");
    }
}

/// Delete source files that are no longer needed after unpacking
pub(crate) async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed source file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove source file"),
        }
    }
}

/// Walk `path`, skipping the admin directory; a matching folder is taken
/// whole and not descended into
fn collect<'a>(
    path: &'a Path,
    targets: &'a mut Targets,
    matches: &'a (dyn Fn(&Path, bool) -> bool + Sync),
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read directory during cleanup");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let entry_path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                if entry.file_name() == ADMIN_DIR {
                    continue;
                }
                if matches(&entry_path, true) {
                    targets.folders.push(entry_path);
                } else {
                    collect(&entry_path, targets, matches).await;
                }
            } else if file_type.is_file() && matches(&entry_path, false) {
                targets.files.push(entry_path);
            }
        }
    })
}

async fn delete(targets: &Targets) -> (usize, usize) {
    let mut files = 0;
    for file in &targets.files {
        match tokio::fs::remove_file(file).await {
            Ok(()) => files += 1,
            Err(e) => warn!(path = %file.display(), error = %e, "failed to delete file"),
        }
    }
    let mut folders = 0;
    for folder in &targets.folders {
        match tokio::fs::remove_dir_all(folder).await {
            Ok(()) => folders += 1,
            Err(e) => warn!(path = %folder.display(), error = %e, "failed to delete folder"),
        }
    }
    (files, folders)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn samples_go_and_the_admin_directory_stays() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("Sample")).unwrap();
        std::fs::write(root.join("Sample/clip.mkv"), b"s").unwrap();
        std::fs::write(root.join("movie-sample.mkv"), b"s").unwrap();
        std::fs::write(root.join("movie.mkv"), b"m").unwrap();
        std::fs::create_dir_all(root.join(ADMIN_DIR)).unwrap();
        std::fs::write(root.join(ADMIN_DIR).join("sample.nzb.gz"), b"n").unwrap();

        remove_samples(root).await;

        assert!(!root.join("Sample").exists(), "sample folder removed");
        assert!(!root.join("movie-sample.mkv").exists(), "sample file removed");
        assert!(root.join("movie.mkv").exists());
        assert!(
            root.join(ADMIN_DIR).join("sample.nzb.gz").exists(),
            "admin files are never touched"
        );
    }

    #[tokio::test]
    async fn markers_are_matched_by_extension() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("info.NFO"), b"n").unwrap();
        std::fs::write(root.join("sub/check.sfv"), b"s").unwrap();
        std::fs::write(root.join("movie.mkv"), b"m").unwrap();

        remove_markers(root, &CleanupConfig::default()).await;

        assert!(!root.join("info.NFO").exists(), "case-insensitive match");
        assert!(!root.join("sub/check.sfv").exists(), "subdirectories are searched");
        assert!(root.join("movie.mkv").exists());
    }
}
