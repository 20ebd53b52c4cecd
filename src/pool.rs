//! Bounded worker pool evaluating rule sets against pending work items.
//!
//! The dispatcher feeds a bounded job channel and workers feed a result
//! channel back; the job channel's capacity is the back-pressure bound on
//! in-flight work. Workers check the task deadline before every dequeue and
//! before every rule run, and drain politely on expiry: the in-flight commit
//! is flushed to the result channel with its retry counter bumped so the
//! counter gets persisted.
//!
//! The pool never touches the store. The task hands it the pending commits
//! and writes its output through the outcome gate, which keeps this module
//! free of storage races.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::{RefEntry, Tuning};
use crate::model::{CommitStatus, RefState, RelevantCommit, RuleStatus};
use crate::rules::{RuleContext, RuleSet};
use crate::task::TaskContext;

pub async fn run_pool(
    ctx: &TaskContext,
    tuning: &Tuning,
    entry: &RefEntry,
    state: &RefState,
    pending: Vec<RelevantCommit>,
) -> Vec<RelevantCommit> {
    if pending.is_empty() {
        return vec![];
    }
    let n_commits = pending.len();
    let n_workers = tuning.max_workers.min(1 + n_commits.div_ceil(2)).max(1);
    let (job_tx, job_rx) =
        mpsc::channel::<RelevantCommit>(n_workers * tuning.commits_per_worker.max(1));
    let job_rx = Arc::new(AsyncMutex::new(job_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<RelevantCommit>(n_commits);
    debug!(
        "{}: auditing {} commits on {} workers",
        state.ref_url, n_commits, n_workers
    );

    let workers: Vec<_> = (0..n_workers)
        .map(|worker_id| {
            let ctx = ctx.clone();
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let rule_sets = entry.rule_sets.clone();
            let ref_url = state.ref_url.clone();
            let metadata = state.metadata.clone();
            let max_retries = tuning.max_retries_per_commit;
            tokio::spawn(async move {
                loop {
                    if ctx.expired() {
                        break;
                    }
                    let job = {
                        let mut rx = job_rx.lock().await;
                        tokio::select! {
                            _ = ctx.expiry() => None,
                            job = rx.recv() => job,
                        }
                    };
                    let Some(commit) = job else { break };
                    let produced =
                        run_rules(&ctx, &rule_sets, &ref_url, &metadata, commit, max_retries).await;
                    if result_tx.send(produced).await.is_err() {
                        break;
                    }
                }
                debug!("worker {} done", worker_id);
            })
        })
        .collect();
    // Workers hold the remaining clones; the channel closes when they exit.
    drop(result_tx);

    let dispatcher = async move {
        for commit in pending {
            tokio::select! {
                _ = ctx.expiry() => break,
                sent = job_tx.send(commit) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        // Dropping the sender is the end-of-jobs signal.
    };
    let collector = async {
        let mut produced = Vec::with_capacity(n_commits);
        while let Some(commit) = result_rx.recv().await {
            produced.push(commit);
        }
        produced
    };
    let ((), produced) = tokio::join!(dispatcher, collector);
    join_all(workers).await;
    produced
}

/// Evaluates every matching rule set against one commit.
///
/// Rule order within a set is significant: the first evaluation error
/// discards this pass's partial results (they will be recomputed), bumps the
/// retry counter and short-circuits the remaining rule sets. Past the retry
/// cap the commit fails terminally.
async fn run_rules(
    ctx: &TaskContext,
    rule_sets: &[Arc<RuleSet>],
    ref_url: &str,
    metadata: &Option<String>,
    mut commit: RelevantCommit,
    max_retries: u32,
) -> RelevantCommit {
    let original = commit.clone();
    let mut newly_actionable = false;
    for rule_set in rule_sets {
        if !rule_set.matches_commit(
            &commit.author_account,
            &commit.committer_account,
            &commit.commit_message,
        ) {
            continue;
        }
        let rctx = RuleContext {
            triggering_account: rule_set.triggering_account(&commit.author_account),
            ref_url: ref_url.to_owned(),
            metadata: metadata.clone(),
        };
        for rule in &rule_set.rules {
            if ctx.expired() {
                let mut flushed = original.clone();
                flushed.retries += 1;
                return flushed;
            }
            // A rule that already produced a terminal verdict is not re-run;
            // a pending verdict is.
            if commit
                .result_for(rule.name())
                .is_some_and(|r| r.status.is_terminal())
            {
                continue;
            }
            match rule.run(&rctx, &commit).await {
                Ok(result) => {
                    newly_actionable |= matches!(
                        result.status,
                        RuleStatus::Failed | RuleStatus::NotificationRequired
                    );
                    commit.set_result(result);
                }
                Err(e) => {
                    warn!(
                        "{}: rule {:?} errored on {}: {:#}",
                        ref_url,
                        rule.name(),
                        commit.commit_hash,
                        e
                    );
                    let mut flushed = original.clone();
                    flushed.retries += 1;
                    if flushed.retries > max_retries {
                        flushed.status = CommitStatus::Failed;
                    }
                    return flushed;
                }
            }
        }
    }
    commit.recompute_status(newly_actionable);
    commit
}
