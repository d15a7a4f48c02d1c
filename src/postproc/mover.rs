//! Moving the output of a job to its final directory

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::FileCollisionAction;
use crate::directunpack::EXTRACT_DIR;
use crate::error::{Error, PostProcessError, Result};
use crate::persistence::ADMIN_DIR;
use crate::utils::{get_unique_path, move_file};

/// Move everything in `job_dir` except the admin directory to `destination`
///
/// The contents of the `extracted` directory land at the top of
/// `destination`. Returns the number of files moved.
pub(crate) async fn move_output(
    job_dir: &Path,
    destination: &Path,
    collision: FileCollisionAction,
) -> Result<usize> {
    tokio::fs::create_dir_all(destination).await?;
    let mut moved = 0;

    let extracted = job_dir.join(EXTRACT_DIR);
    if tokio::fs::try_exists(&extracted).await.unwrap_or(false) {
        moved += move_tree(&extracted, destination, collision).await?;
    }

    let mut entries = tokio::fs::read_dir(job_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name == ADMIN_DIR || name == EXTRACT_DIR {
            continue;
        }
        let source = entry.path();
        let target = destination.join(&name);
        if entry.file_type().await?.is_dir() {
            moved += move_tree(&source, &target, collision).await?;
        } else if move_one(&source, &target, collision).await? {
            moved += 1;
        }
    }
    info!(source = %job_dir.display(), destination = %destination.display(), files = moved, "job output moved");
    Ok(moved)
}

/// Move the contents of `source` into `destination`, removing emptied folders
fn move_tree<'a>(
    source: &'a Path,
    destination: &'a Path,
    collision: FileCollisionAction,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<usize>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(destination).await?;
        let mut moved = 0;
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let target = destination.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                moved += move_tree(&path, &target, collision).await?;
            } else if move_one(&path, &target, collision).await? {
                moved += 1;
            }
        }
        if let Err(e) = tokio::fs::remove_dir(source).await {
            debug!(path = %source.display(), error = %e, "source folder not removed");
        }
        Ok(moved)
    })
}

/// Move one file; false when it was skipped because the target exists
async fn move_one(source: &Path, target: &Path, collision: FileCollisionAction) -> Result<bool> {
    let final_target: PathBuf = match get_unique_path(target, collision) {
        Ok(path) => path,
        Err(Error::PostProcess(PostProcessError::FileCollision { .. }))
            if collision == FileCollisionAction::Skip =>
        {
            warn!(path = %target.display(), "target exists, file skipped");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    move_file(source, &final_target).await?;
    debug!(source = %source.display(), target = %final_target.display(), "moved file");
    Ok(true)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job_dir(root: &Path) -> PathBuf {
        let job = root.join("incomplete/Job");
        std::fs::create_dir_all(job.join(ADMIN_DIR)).unwrap();
        std::fs::create_dir_all(job.join(EXTRACT_DIR).join("Subs")).unwrap();
        std::fs::write(job.join(ADMIN_DIR).join("Job.nzb.gz"), b"n").unwrap();
        std::fs::write(job.join(EXTRACT_DIR).join("movie.mkv"), b"new").unwrap();
        std::fs::write(job.join(EXTRACT_DIR).join("Subs/en.srt"), b"s").unwrap();
        std::fs::write(job.join("readme.txt"), b"r").unwrap();
        job
    }

    #[tokio::test]
    async fn extracted_files_land_at_the_top() {
        let dir = TempDir::new().unwrap();
        let job = job_dir(dir.path());
        let dest = dir.path().join("complete/Job");

        let moved = move_output(&job, &dest, FileCollisionAction::Rename)
            .await
            .unwrap();

        assert_eq!(moved, 3);
        assert!(dest.join("movie.mkv").is_file());
        assert!(dest.join("Subs/en.srt").is_file());
        assert!(dest.join("readme.txt").is_file());
        assert!(!dest.join(ADMIN_DIR).exists(), "admin directory stays behind");
        assert!(job.join(ADMIN_DIR).join("Job.nzb.gz").is_file());
    }

    #[tokio::test]
    async fn collisions_follow_the_configured_action() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("complete/Job");
        std::fs::create_dir_all(&dest).unwrap();

        std::fs::write(dest.join("movie.mkv"), b"old").unwrap();
        move_output(&job_dir(dir.path()), &dest, FileCollisionAction::Rename)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest.join("movie.mkv")).unwrap(), b"old");
        assert_eq!(std::fs::read(dest.join("movie (1).mkv")).unwrap(), b"new");

        std::fs::remove_dir_all(dir.path().join("incomplete")).unwrap();
        let moved = move_output(&job_dir(dir.path()), &dest, FileCollisionAction::Skip)
            .await
            .unwrap();
        assert_eq!(moved, 0, "every target exists");
        assert_eq!(std::fs::read(dest.join("movie.mkv")).unwrap(), b"old");
    }
}
