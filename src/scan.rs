//! Classifies fetched commits and persists the relevant ones as audit work
//! items. Writes go in fixed-size batches, oldest first, and every batch's
//! transaction also advances the ref watermark over the commits it covers, so
//! a deadline mid-scan always leaves a resumable prefix behind.

use log::debug;

use crate::config::RefEntry;
use crate::gitlog::Commit;
use crate::model::{CommitStatus, RefState, RelevantCommit};
use crate::task::{AuditError, Deps, TaskContext};

const WRITE_BATCH_SIZE: usize = 100;

#[derive(Debug, Default, PartialEq)]
pub struct ScanStats {
    /// Newly persisted relevant commits.
    pub relevant: usize,
    pub truncated: bool,
}

/// Walks `log` (newest first, as fetched) chronologically, linking each
/// relevant commit to its next-older relevant sibling and falling back to the
/// ref's pre-existing `last_relevant_commit` for the oldest one.
pub async fn classify_and_store(
    ctx: &TaskContext,
    deps: &Deps,
    entry: &RefEntry,
    state: &mut RefState,
    log: &[Commit],
) -> Result<ScanStats, AuditError> {
    let mut stats = ScanStats::default();
    if log.is_empty() {
        return Ok(stats);
    }

    let oldest_first: Vec<&Commit> = log.iter().rev().collect();
    let mut prev_relevant = state.last_relevant_commit.clone();
    let n_batches = oldest_first.len().div_ceil(WRITE_BATCH_SIZE);

    for (i, batch) in oldest_first.chunks(WRITE_BATCH_SIZE).enumerate() {
        if ctx.expired() {
            debug!(
                "{}: deadline hit after {} of {} batches",
                state.ref_url, i, n_batches
            );
            stats.truncated = true;
            return Ok(stats);
        }

        let mut candidates = Vec::new();
        let mut batch_newest_relevant = None;
        for commit in batch {
            let relevant = entry.rule_sets.iter().any(|rs| {
                rs.matches_commit(&commit.author.email, &commit.committer.email, &commit.message)
            });
            if !relevant {
                continue;
            }
            candidates.push(RelevantCommit {
                ref_url: state.ref_url.clone(),
                commit_hash: commit.id.clone(),
                previous_relevant_commit: prev_relevant.clone(),
                status: CommitStatus::Scheduled,
                commit_time: commit.committer.time,
                committer_account: commit.committer.email.clone(),
                author_account: commit.author.email.clone(),
                commit_message: commit.message.clone(),
                result: vec![],
                retries: 0,
                notification_state: Default::default(),
                notified_all: false,
            });
            prev_relevant = commit.id.clone();
            batch_newest_relevant = Some((commit.id.clone(), commit.committer.time));
        }

        // A concurrent or truncated earlier run may have persisted some of
        // these already; only previously-unseen commits are written.
        let hashes: Vec<_> = candidates.iter().map(|c| c.commit_hash.clone()).collect();
        let existing = deps.store.existing_hashes(&state.ref_url, &hashes).await?;
        let fresh: Vec<_> = candidates
            .into_iter()
            .filter(|c| !existing.contains(&c.commit_hash))
            .collect();
        stats.relevant += fresh.len();

        let batch_newest = batch.last().expect("chunks are never empty");
        let watermark = (batch_newest.id.clone(), batch_newest.committer.time);
        let is_last = i == n_batches - 1;
        let now = ctx.now;
        deps.store
            .transact(
                &state.ref_url,
                Box::new(move |txn| {
                    for commit in fresh {
                        txn.put_commit(commit);
                    }
                    let mut s = txn.ref_state()?;
                    (s.last_known_commit, s.last_known_commit_time) = watermark;
                    if let Some((hash, time)) = batch_newest_relevant {
                        s.last_relevant_commit = hash;
                        s.last_relevant_commit_time = time;
                    }
                    if is_last {
                        s.last_updated_time = now;
                    }
                    txn.put_ref_state(s);
                    Ok(())
                }),
            )
            .await?;

        state.last_known_commit = batch_newest.id.clone();
        state.last_known_commit_time = batch_newest.committer.time;
        state.last_relevant_commit = prev_relevant.clone();
        if is_last {
            state.last_updated_time = now;
        }
    }

    Ok(stats)
}
