//! User script invocation
//!
//! The script is called with positional arguments:
//!
//! 1. output directory
//! 2. NZB filename
//! 3. job name
//! 4. indexer report number (always empty)
//! 5. category
//! 6. newsgroup (first group of the first file)
//! 7. post-processing status (0 = ok, 1 = failed verification, 2 = failed unpack)
//! 8. source URL

use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{PostProcessError, Result};
use crate::job::NzbObject;
use crate::process;

/// Run `script` for `job` with `dir` as working directory
pub(crate) async fn run_script(
    script: &Path,
    job: &NzbObject,
    dir: &Path,
    status: u8,
    cancel: &CancellationToken,
) -> Result<()> {
    let group = job
        .files
        .first()
        .and_then(|f| f.groups.first())
        .cloned()
        .unwrap_or_default();
    let args = [
        dir.to_string_lossy().into_owned(),
        job.nzb_name.clone(),
        job.name.clone(),
        String::new(),
        job.category.clone().unwrap_or_default(),
        group,
        status.to_string(),
        job.url.clone().unwrap_or_default(),
    ];
    info!(job_id = %job.id, script = %script.display(), "running user script");
    let output = process::run(script, &args, Some(dir), cancel).await?;
    for line in &output.lines {
        debug!(job_id = %job.id, line = %line, "script output");
    }
    if output.status.success() {
        Ok(())
    } else {
        Err(PostProcessError::ScriptFailed {
            script: script.to_path_buf(),
            code: output.status.code(),
        }
        .into())
    }
}
