//! Filesystem helpers: collision-free paths, sample detection, positional
//! writes, cross-device moves and free-space queries

use crate::config::FileCollisionAction;
use crate::error::{Error, PostProcessError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Maximum number of `name (n).ext` candidates tried on a collision
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Resolve the destination of a move according to `action`
///
/// * `Overwrite` returns `path` unchanged.
/// * `Skip` fails with [`PostProcessError::FileCollision`] when `path` exists.
/// * `Rename` appends ` (1)`, ` (2)`, ... to the stem until the name is free.
///
/// ```
/// use usenet_engine::utils::get_unique_path;
/// use usenet_engine::config::FileCollisionAction;
/// use std::path::Path;
///
/// let path = Path::new("/nonexistent-dir/movie.mkv");
/// let unique = get_unique_path(path, FileCollisionAction::Rename).unwrap();
/// assert_eq!(unique, path);
/// ```
pub fn get_unique_path(path: &Path, action: FileCollisionAction) -> Result<PathBuf> {
    match action {
        FileCollisionAction::Overwrite => Ok(path.to_path_buf()),
        FileCollisionAction::Skip => {
            if path.exists() {
                return Err(Error::PostProcess(PostProcessError::FileCollision {
                    path: path.to_path_buf(),
                    reason: "file already exists and collision action is skip".to_string(),
                }));
            }
            Ok(path.to_path_buf())
        }
        FileCollisionAction::Rename => {
            if !path.exists() {
                return Ok(path.to_path_buf());
            }
            let invalid = |reason: &str| {
                Error::PostProcess(PostProcessError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: reason.to_string(),
                })
            };
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| invalid("cannot extract file stem"))?;
            let extension = path.extension().and_then(|e| e.to_str());
            let parent = path
                .parent()
                .ok_or_else(|| invalid("cannot extract parent directory"))?;

            for i in 1..=MAX_RENAME_ATTEMPTS {
                let candidate = parent.join(match extension {
                    Some(ext) => format!("{stem} ({i}).{ext}"),
                    None => format!("{stem} ({i})"),
                });
                if !candidate.exists() {
                    return Ok(candidate);
                }
            }
            Err(Error::PostProcess(PostProcessError::FileCollision {
                path: path.to_path_buf(),
                reason: format!("no free name after {MAX_RENAME_ATTEMPTS} attempts"),
            }))
        }
    }
}

/// Whether a path looks like a sample file or folder
///
/// ```
/// use std::path::Path;
/// use usenet_engine::utils::is_sample;
///
/// assert!(is_sample(Path::new("/downloads/Movie/Sample")));
/// assert!(is_sample(Path::new("/downloads/Movie/movie-sample.mkv")));
/// assert!(!is_sample(Path::new("/downloads/Movie/movie.mkv")));
/// ```
#[must_use]
pub fn is_sample(path: &Path) -> bool {
    const SAMPLE_FOLDERS: &[&str] = &["samples", "proof", "proofs"];

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    SAMPLE_FOLDERS.contains(&name.as_str()) || name.contains("sample")
}

/// Lower-case hex rendering of a byte slice
pub fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Write all of `data` at byte `offset` without moving a shared cursor
pub fn write_all_at(file: &File, data: &[u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(data, offset)
    }
    #[cfg(windows)]
    {
        use std::os::windows::fs::FileExt;
        let mut written = 0;
        while written < data.len() {
            let n = file.seek_write(&data[written..], offset + written as u64)?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            written += n;
        }
        Ok(())
    }
}

/// Move a file, copying across filesystems when a rename is impossible
pub async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(source, dest).await.map_err(|e| {
        Error::PostProcess(PostProcessError::MoveFailed {
            source_path: source.to_path_buf(),
            dest_path: dest.to_path_buf(),
            reason: e.to_string(),
        })
    })?;
    tokio::fs::remove_file(source).await?;
    Ok(())
}

/// Free space for unprivileged users on the filesystem holding `path`
#[allow(clippy::unnecessary_cast)]
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string and `stat` is only
        // read after statvfs reported success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: `wide` is NUL-terminated and the out-pointers reference
        // live, aligned u64 locals.
        unsafe {
            let mut available: u64 = 0;
            let mut total: u64 = 0;
            let mut free: u64 = 0;
            if GetDiskFreeSpaceExW(
                wide.as_ptr(),
                &mut available as *mut u64 as *mut _,
                &mut total as *mut u64 as *mut _,
                &mut free as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }
            Ok(available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk space checking is not supported on this platform",
        ))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn rename_appends_counter_until_free() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.mkv");
        fs::write(&path, b"a").unwrap();
        fs::write(dir.path().join("movie (1).mkv"), b"b").unwrap();

        let unique = get_unique_path(&path, FileCollisionAction::Rename).unwrap();
        assert_eq!(unique, dir.path().join("movie (2).mkv"));

        let bare = dir.path().join("README");
        fs::write(&bare, b"c").unwrap();
        assert_eq!(
            get_unique_path(&bare, FileCollisionAction::Rename).unwrap(),
            dir.path().join("README (1)"),
            "files without extension get a plain suffix"
        );
    }

    #[test]
    fn skip_and_overwrite_on_collision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        fs::write(&path, b"a").unwrap();

        let err = get_unique_path(&path, FileCollisionAction::Skip).unwrap_err();
        assert_eq!(err.error_code(), "file_collision");
        assert_eq!(
            get_unique_path(&path, FileCollisionAction::Overwrite).unwrap(),
            path
        );
    }

    #[test]
    fn sample_detection() {
        assert!(is_sample(Path::new("Proof")));
        assert!(is_sample(Path::new("x/Movie.SAMPLE.mkv")));
        assert!(!is_sample(Path::new("x/Movie.mkv")));
        assert!(!is_sample(Path::new("")));
    }

    #[test]
    fn hex_string_is_lowercase_and_padded() {
        assert_eq!(hex_string(&[0x00, 0x0f, 0xab]), "000fab");
        assert_eq!(hex_string(&[]), "");
    }

    #[test]
    fn positional_writes_fill_holes_in_any_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .unwrap();
        write_all_at(&file, b"world", 5).unwrap();
        write_all_at(&file, b"hello", 0).unwrap();
        drop(file);
        assert_eq!(fs::read(&path).unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn move_file_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"payload").unwrap();
        let dest = dir.path().join("nested/deeper/dest.bin");

        move_file(&src, &dest).await.unwrap();
        assert!(!src.exists(), "source is gone after the move");
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }

    #[test]
    fn available_space_of_temp_dir() {
        let dir = TempDir::new().unwrap();
        let space = get_available_space(dir.path());
        assert!(space.is_ok(), "statvfs on an existing dir succeeds");
    }
}
