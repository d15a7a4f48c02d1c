//! Files in a job's admin directory
//!
//! | File | Contents |
//! |---|---|
//! | `nzo_<id>` | job snapshot (JSON) |
//! | `SABnzbd_nzf_<n>` | article table of file `n` (JSON) |
//! | `SABnzbd_article_<..>` | spilled article payloads, see [`crate::cache`] |
//! | `<name>.nzb.gz` | the NZB the job was created from |
//! | `__ATTRIB__` | `key=value` lines with the job options |
//! | `RENAMES` | current name -> original name (JSON) |
//! | `VERIFIED` | par2 set -> verified (JSON) |

use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::write_atomic;
use crate::config::PostProcess;
use crate::error::{Error, Result};
use crate::job::{Article, NzbFile, NzbObject};
use crate::types::{JobId, JobOptions, Priority};

/// Job options file
pub const ATTRIB_FILE: &str = "__ATTRIB__";
/// Rename log file
pub const RENAMES_FILE: &str = "RENAMES";
/// Verified par2 sets file
pub const VERIFIED_FILE: &str = "VERIFIED";

/// The options of a job, enough to rebuild it from its NZB backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobAttributes {
    /// Job name
    pub name: String,
    /// Category
    pub category: Option<String>,
    /// Post-processing mode
    pub post_process: PostProcess,
    /// User script
    pub script: Option<PathBuf>,
    /// Priority
    pub priority: Priority,
    /// Archive password
    pub password: Option<String>,
    /// Source URL
    pub url: Option<String>,
}

impl JobAttributes {
    /// Attributes of `job`
    pub fn from_job(job: &NzbObject) -> Self {
        Self {
            name: job.name.clone(),
            category: job.category.clone(),
            post_process: job.post_process,
            script: job.script.clone(),
            priority: job.priority,
            password: job.password.clone(),
            url: job.url.clone(),
        }
    }

    /// Options that recreate a job with these attributes
    pub fn to_options(&self) -> JobOptions {
        JobOptions {
            category: self.category.clone(),
            post_process: Some(self.post_process),
            priority: self.priority,
            password: self.password.clone(),
            script: self.script.clone(),
            url: self.url.clone(),
        }
    }

    fn to_text(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: &str| {
            out.push_str(key);
            out.push('=');
            out.push_str(&value.replace('\n', " "));
            out.push('\n');
        };
        line("final_name", &self.name);
        if let Some(category) = &self.category {
            line("cat", category);
        }
        line("pp", &self.post_process.to_i32().to_string());
        if let Some(script) = &self.script {
            line("script", &script.to_string_lossy());
        }
        line("priority", &self.priority.to_i32().to_string());
        if let Some(password) = &self.password {
            line("password", password);
        }
        if let Some(url) = &self.url {
            line("url", url);
        }
        out
    }

    fn from_text(text: &str) -> Self {
        let mut attributes = Self {
            name: String::new(),
            category: None,
            post_process: PostProcess::default(),
            script: None,
            priority: Priority::Normal,
            password: None,
            url: None,
        };
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.to_string();
            match key.trim() {
                "final_name" => attributes.name = value,
                "cat" => attributes.category = Some(value),
                "pp" => {
                    if let Ok(pp) = value.trim().parse() {
                        attributes.post_process = PostProcess::from_i32(pp);
                    }
                }
                "script" => attributes.script = Some(PathBuf::from(value)),
                "priority" => {
                    if let Ok(priority) = value.trim().parse() {
                        attributes.priority = Priority::from_i32(priority);
                    }
                }
                "password" => attributes.password = Some(value),
                "url" => attributes.url = Some(value),
                other => debug!(key = other, "unknown attribute ignored"),
            }
        }
        attributes
    }
}

/// Write `__ATTRIB__`
pub async fn save_attributes(admin: &Path, attributes: &JobAttributes) -> Result<()> {
    write_atomic(&admin.join(ATTRIB_FILE), attributes.to_text().as_bytes()).await
}

/// Read `__ATTRIB__`
pub async fn load_attributes(admin: &Path) -> Result<JobAttributes> {
    let text = tokio::fs::read_to_string(admin.join(ATTRIB_FILE)).await?;
    Ok(JobAttributes::from_text(&text))
}

/// Store the compressed NZB as `<nzb name>.nzb.gz`
pub async fn save_nzb_backup(admin: &Path, nzb_name: &str, data: &[u8]) -> Result<PathBuf> {
    let base = crate::nzb::strip_nzb_extension(nzb_name);
    let path = admin.join(format!("{base}.nzb.gz"));
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;
    write_atomic(&path, &compressed).await?;
    Ok(path)
}

/// The NZB backup in `admin`, if any
pub async fn find_nzb_backup(admin: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(admin).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.to_ascii_lowercase().ends_with(".nzb.gz"))
        {
            return Some(path);
        }
    }
    None
}

/// Write the article table of `file`
pub async fn save_article_table(admin: &Path, file: &NzbFile) -> Result<()> {
    let data = serde_json::to_vec(&file.decodetable)?;
    write_atomic(&admin.join(file.id.table_name()), &data).await
}

/// Read an article table written by [`save_article_table`]
pub async fn load_article_table(path: &Path) -> Result<Vec<Article>> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write the rename log
pub async fn save_renames(admin: &Path, renames: &BTreeMap<String, String>) -> Result<()> {
    write_atomic(&admin.join(RENAMES_FILE), &serde_json::to_vec(renames)?).await
}

/// Read the rename log; empty when there is none
pub async fn load_renames(admin: &Path) -> Result<BTreeMap<String, String>> {
    load_map(&admin.join(RENAMES_FILE)).await
}

/// Write the verified par2 sets
pub async fn save_verified(admin: &Path, verified: &BTreeMap<String, bool>) -> Result<()> {
    write_atomic(&admin.join(VERIFIED_FILE), &serde_json::to_vec(verified)?).await
}

/// Read the verified par2 sets; empty when there are none
pub async fn load_verified(admin: &Path) -> Result<BTreeMap<String, bool>> {
    load_map(&admin.join(VERIFIED_FILE)).await
}

async fn load_map<V: serde::de::DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, V>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Snapshot a job: its article tables, options and the job itself
///
/// Files whose table is only partly in memory get the in-memory articles
/// merged into the table on disk.
pub async fn save_job(job: &NzbObject) -> Result<()> {
    let admin = &job.admin_path;
    tokio::fs::create_dir_all(admin).await?;
    for file in &job.files {
        if file.import_finished {
            if !file.decodetable.is_empty() {
                save_article_table(admin, file).await?;
            }
            continue;
        }
        if file.decodetable.is_empty() {
            continue;
        }
        let path = admin.join(file.id.table_name());
        match load_article_table(&path).await {
            Ok(mut table) => {
                for (slot, current) in table.iter_mut().zip(&file.decodetable) {
                    *slot = current.clone();
                }
                let data = serde_json::to_vec(&table)?;
                write_atomic(&path, &data).await?;
            }
            Err(e) => {
                warn!(job_id = %job.id, file = %file.id, error = %e, "article table unreadable, keeping it");
            }
        }
    }
    save_attributes(admin, &JobAttributes::from_job(job)).await?;
    save_renames(admin, &job.renames).await?;
    save_verified(admin, &job.verified).await?;
    let data = serde_json::to_vec(job)?;
    write_atomic(&admin.join(job.id.snapshot_name()), &data).await?;
    debug!(job_id = %job.id, files = job.files.len(), "job snapshot saved");
    Ok(())
}

/// Load a job snapshot
///
/// Article tables stay on disk; the queue imports them when the files are
/// first requested.
pub async fn load_job(admin: &Path, id: JobId) -> Result<NzbObject> {
    let path = admin.join(id.snapshot_name());
    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!(
                "job snapshot {} does not exist",
                path.display()
            )),
            _ => Error::Io(e),
        })?;
    let mut job: NzbObject = serde_json::from_slice(&data)?;
    for file in &mut job.files {
        file.import_finished = false;
    }
    Ok(job)
}

/// Remove an admin directory and everything in it
pub async fn purge_admin(admin: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(admin).await {
        Ok(()) => {
            debug!(path = %admin.display(), "admin directory removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
