//! PAR2 verification and repair of a downloaded job

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Context;
use crate::error::{Error, PostProcessError, Result};
use crate::job::NzbObject;
use crate::persistence;
use crate::types::{Event, Status};

/// How verification of a job ended
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Every set is intact or repaired (or there is nothing to verify)
    Intact,
    /// A set needs more recovery blocks that are still held back
    NeedBlocks { setname: String, blocks: u32 },
}

/// The par2 file to hand to the verifier for each set: the smallest one on disk
pub(crate) fn par2_sets(job: &NzbObject) -> BTreeMap<String, PathBuf> {
    let mut best: BTreeMap<String, (u32, PathBuf)> = BTreeMap::new();
    for file in &job.files {
        let Some(setname) = file.setname.as_ref().filter(|_| file.is_par2) else {
            continue;
        };
        let path = job.download_path.join(&file.filename);
        if !path.is_file() {
            continue;
        }
        match best.get(setname) {
            Some((blocks, _)) if *blocks <= file.blocks => {}
            _ => {
                best.insert(setname.clone(), (file.blocks, path));
            }
        }
    }
    best.into_iter().map(|(set, (_, path))| (set, path)).collect()
}

/// Verify every par2 set of `job`, repairing where the blocks on disk suffice
///
/// Sets already recorded as verified are skipped. The verified map is saved
/// to the admin directory after each set.
pub(crate) async fn verify_and_repair(
    ctx: &Context,
    job: &mut NzbObject,
    cancel: &CancellationToken,
) -> Result<Verdict> {
    let sets = par2_sets(job);
    if sets.is_empty() {
        debug!(job_id = %job.id, "no par2 files, skipping verification");
        return Ok(Verdict::Intact);
    }

    for (setname, par2) in sets {
        if job.verified.get(&setname) == Some(&true) {
            continue;
        }
        ctx.emit(Event::Verifying { id: job.id });
        let result = match ctx.parity.verify(&par2, cancel).await {
            Ok(result) => result,
            Err(Error::NotSupported(message)) => {
                warn!(job_id = %job.id, setname = %setname, reason = %message, "par2 verification not available");
                continue;
            }
            Err(e) => return Err(e),
        };
        info!(
            job_id = %job.id,
            setname = %setname,
            complete = result.is_complete,
            damaged_blocks = result.damaged_blocks,
            recovery_blocks = result.recovery_blocks_available,
            blocks_needed = result.blocks_needed,
            "par2 verification finished"
        );

        if result.is_complete {
            record(job, &setname, true).await;
            continue;
        }

        if !result.repairable {
            let needed = result.blocks_needed.max(1);
            if job.available_extra_blocks(&setname) > 0 {
                return Ok(Verdict::NeedBlocks {
                    setname,
                    blocks: needed,
                });
            }
            record(job, &setname, false).await;
            return Err(PostProcessError::RepairFailed {
                id: job.id.to_string(),
                reason: format!("{setname}: {needed} more recovery blocks needed, none left"),
            }
            .into());
        }

        if !ctx.parity.can_repair() {
            record(job, &setname, false).await;
            return Err(PostProcessError::RepairFailed {
                id: job.id.to_string(),
                reason: format!("{setname} is damaged and no par2 repair tool is available"),
            }
            .into());
        }

        job.status = Status::Repairing;
        ctx.emit(Event::StatusChanged {
            id: job.id,
            status: Status::Repairing,
        });
        ctx.emit(Event::Repairing {
            id: job.id,
            blocks_needed: result.damaged_blocks,
        });
        let repaired = ctx.parity.repair(&par2, cancel).await?;
        if !repaired.success {
            record(job, &setname, false).await;
            return Err(PostProcessError::RepairFailed {
                id: job.id.to_string(),
                reason: repaired
                    .error
                    .unwrap_or_else(|| format!("{setname} could not be repaired")),
            }
            .into());
        }
        info!(job_id = %job.id, setname = %setname, files = repaired.repaired_files.len(), "par2 repair succeeded");
        record(job, &setname, true).await;
    }
    Ok(Verdict::Intact)
}

async fn record(job: &mut NzbObject, setname: &str, ok: bool) {
    job.verified.insert(setname.to_string(), ok);
    if let Err(e) = persistence::save_verified(&job.admin_path, &job.verified).await {
        warn!(job_id = %job.id, error = %e, "failed to save verified sets");
    }
}
