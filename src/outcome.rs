//! Race-safe commit of audit results. Two task runs for the same ref can
//! overlap (scheduler misfire, manual trigger); this gate is the only thing
//! that keeps them from losing each other's updates, so it re-reads every
//! commit inside the transaction and only overwrites rows that are still in
//! a workable state.

use log::debug;

use crate::model::RelevantCommit;
use crate::task::{AuditError, Deps, TaskContext};

pub async fn write_outcomes(
    ctx: &TaskContext,
    deps: &Deps,
    ref_url: &str,
    produced: Vec<RelevantCommit>,
) -> Result<(), AuditError> {
    if produced.is_empty() {
        return Ok(());
    }
    if ctx.expired() {
        // Results in hand still get persisted; expiry only means nothing new
        // is started after this write.
        debug!("{}: writing {} outcomes past the deadline", ref_url, produced.len());
    }
    let mut settled: Vec<(String, &'static str)> = Vec::new();
    deps.store
        .transact(
            ref_url,
            Box::new(|txn| {
                for commit in produced {
                    match txn.commit(&commit.commit_hash)? {
                        Some(current) if current.status.is_workable() => {
                            if commit.status.is_terminal() {
                                settled.push((
                                    commit.commit_hash.clone(),
                                    match commit.status {
                                        crate::model::CommitStatus::Completed => "completed",
                                        crate::model::CommitStatus::ActionRequired => {
                                            "action-required"
                                        }
                                        _ => "failed",
                                    },
                                ));
                            }
                            txn.put_commit(commit);
                        }
                        // Another run got here first (or the row vanished);
                        // drop our version.
                        _ => debug!("{}: dropping stale outcome for {}", ref_url, commit),
                    }
                }
                Ok(())
            }),
        )
        .await?;
    for (hash, status) in settled {
        debug!("{}: commit {} settled as {}", ref_url, hash, status);
        deps.metrics.inc_with("audit_results", status);
    }
    Ok(())
}
