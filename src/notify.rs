//! Notification passes for commits that ended up needing attention.
//!
//! Both passes persist before surfacing: whatever per-rule-set state a
//! notifier managed to return is written back even when a later notifier
//! errors, so redelivery stays idempotent across task runs.

use itertools::Itertools as _;
use log::{info, warn};

use crate::config::RefEntry;
use crate::model::{CommitStatus, RefState, RelevantCommit, AUDIT_FAILURE_KEY};
use crate::rules::RuleContext;
use crate::task::{AuditError, Deps, TaskContext};
use crate::tracker::IssueRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyOutcome {
    Completed,
    /// The deadline expired mid-pass; progress so far is persisted and the
    /// remaining commits wait for the next scheduled run.
    Truncated,
}

/// Violation pass: every rule set that claims an action-required commit gets
/// its notifier invoked with the previously recorded delivery state.
/// `notified_all` is only set once a full pass over the commit ran without
/// errors.
pub async fn notify_about_violations(
    ctx: &TaskContext,
    deps: &Deps,
    entry: &RefEntry,
    state: &RefState,
) -> Result<NotifyOutcome, AuditError> {
    let commits = deps
        .store
        .commits_with_status(&state.ref_url, CommitStatus::ActionRequired, false)
        .await?;
    for mut commit in commits {
        let mut errors = Vec::new();
        for rule_set in &entry.rule_sets {
            if !rule_set.matches_commit(
                &commit.author_account,
                &commit.committer_account,
                &commit.commit_message,
            ) {
                continue;
            }
            if ctx.expired() {
                persist_notification_state(deps, &state.ref_url, &commit).await?;
                return Ok(NotifyOutcome::Truncated);
            }
            let rctx = RuleContext {
                triggering_account: rule_set.triggering_account(&commit.author_account),
                ref_url: state.ref_url.clone(),
                metadata: state.metadata.clone(),
            };
            let prev = commit.notification_state.get(&rule_set.name).cloned();
            match rule_set
                .notifier
                .notify(&rctx, &commit, prev.as_deref())
                .await
            {
                Ok(new_state) => {
                    commit
                        .notification_state
                        .insert(rule_set.name.clone(), new_state);
                }
                Err(e) => {
                    deps.metrics.inc("notification_failures");
                    errors.push(format!("{}: {:#}", rule_set.name, e));
                }
            }
        }
        if errors.is_empty() {
            commit.notified_all = true;
        } else {
            warn!(
                "{}: notification of {} incomplete: {}",
                state.ref_url,
                commit.commit_hash,
                errors.iter().join("; ")
            );
        }
        persist_notification_state(deps, &state.ref_url, &commit).await?;
    }
    Ok(NotifyOutcome::Completed)
}

/// Audit-failure pass: one tracker issue per commit whose rules could not be
/// evaluated within the retry cap. Once filed, the commit is settled and
/// never looked at again.
pub async fn notify_about_audit_failures(
    ctx: &TaskContext,
    deps: &Deps,
    _entry: &RefEntry,
    state: &RefState,
) -> Result<NotifyOutcome, AuditError> {
    let commits = deps
        .store
        .commits_with_status(&state.ref_url, CommitStatus::Failed, false)
        .await?;
    for mut commit in commits {
        if ctx.expired() {
            return Ok(NotifyOutcome::Truncated);
        }
        let request = IssueRequest {
            project: state.config_name.clone(),
            summary: format!(
                "commit audit could not evaluate {} on {}",
                commit.commit_hash, state.ref_url
            ),
            description: format!(
                "Rule evaluation for commit {} kept failing and gave up after \
                 {} attempts. The commit will not be re-audited.",
                commit.commit_hash, commit.retries
            ),
            components: vec![],
            labels: vec!["commit-audit-failure".to_owned()],
        };
        match deps.tracker.create_issue(request).await {
            Ok(issue) => {
                info!(
                    "{}: filed issue {} for repeated audit failure of {}",
                    state.ref_url, issue, commit.commit_hash
                );
                commit
                    .notification_state
                    .insert(AUDIT_FAILURE_KEY.to_owned(), issue.to_string());
                commit.notified_all = true;
                persist_notification_state(deps, &state.ref_url, &commit).await?;
            }
            // Leave notified_all unset; the next pass retries the filing.
            Err(e) => {
                deps.metrics.inc("notification_failures");
                warn!(
                    "{}: couldn't file audit-failure issue for {}: {:#}",
                    state.ref_url, commit.commit_hash, e
                );
            }
        }
    }
    Ok(NotifyOutcome::Completed)
}

/// The notifier dispatcher owns exactly two fields of a commit; everything
/// else is merged from the freshly read row.
async fn persist_notification_state(
    deps: &Deps,
    ref_url: &str,
    commit: &RelevantCommit,
) -> Result<(), AuditError> {
    let hash = commit.commit_hash.clone();
    let notification_state = commit.notification_state.clone();
    let notified_all = commit.notified_all;
    deps.store
        .transact(
            ref_url,
            Box::new(move |txn| {
                if let Some(mut current) = txn.commit(&hash)? {
                    current.notification_state = notification_state;
                    current.notified_all = notified_all;
                    txn.put_commit(current);
                }
                Ok(())
            }),
        )
        .await?;
    Ok(())
}
